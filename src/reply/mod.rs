//! Cross-platform reply chains and the guard that isolates them.

pub mod guard;
pub mod matchers;
pub mod reconstructor;

pub use guard::{GuardStats, ReplyGuard};
pub use matchers::{ReplyMatcher, default_matchers, ref_token};
pub use reconstructor::{
    CorrelationIndex, ReplyHandler, ReplyIntent, ReplyPlan, ReplyReconstructor, ResolvedReply,
};
