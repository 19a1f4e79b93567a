//! LINE send quota: budget tracking, importance policy and alerts.

pub mod alerts;
pub mod clock;
pub mod governor;

pub use alerts::{AlertLevel, QuotaAlert};
pub use clock::{Clock, ManualClock, SystemClock};
pub use governor::{Admission, AdmissionReason, QuotaGovernor, QuotaState, QuotaStatus, period_key};
