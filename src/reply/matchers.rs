//! Ordered text matchers that find an embedded message id.
//!
//! Each matcher pulls one message id out of free text. They are tried in
//! order and the first hit wins.

use regex::Regex;

/// Opening of the token embedded in reply-annotated messages.
pub const REF_TOKEN_PREFIX: &str = "[ref:";

/// Render the token [`ref_token`](default_matchers) recognises.
pub fn ref_token(id: &str) -> String {
    format!("{REF_TOKEN_PREFIX}{id}]")
}

/// A named text pattern that extracts a message id.
#[derive(Debug, Clone)]
pub struct ReplyMatcher {
    /// Strategy name, used in logs and the self-test report.
    pub name: &'static str,
    /// Compiled regex; capture group 1 is the id.
    pub regex: Regex,
    /// Known-good input for the self-test.
    sample: &'static str,
    /// Id the sample must yield.
    expected: &'static str,
}

impl ReplyMatcher {
    /// Extract the first id this matcher finds in `text`.
    pub fn extract(&self, text: &str) -> Option<String> {
        self.regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Check the matcher still recognises its own sample.
    pub fn self_test(&self) -> bool {
        self.extract(self.sample).as_deref() == Some(self.expected)
    }
}

/// The built-in strategies, in priority order.
pub fn default_matchers() -> Vec<ReplyMatcher> {
    vec![
        // Token the bridge embeds in every reply it formats
        ReplyMatcher {
            name: "ref_token",
            regex: Regex::new(r"\[ref:([A-Za-z0-9_-]{1,64})\]").unwrap(),
            sample: "↩️ Alice replied to \"hi\" [ref:1234567890]\nsure",
            expected: "1234567890",
        },
        // A pasted Discord message link
        ReplyMatcher {
            name: "discord_jump_link",
            regex: Regex::new(
                r"https?://(?:(?:ptb|canary)\.)?discord(?:app)?\.com/channels/(?:\d+|@me)/\d+/(\d+)",
            )
            .unwrap(),
            sample: "see https://discord.com/channels/111/222/333444555",
            expected: "333444555",
        },
        // Hand-typed "re #id" / "reply to #id"
        ReplyMatcher {
            name: "reply_marker",
            regex: Regex::new(r"(?i)\b(?:reply to|re)\s*:?\s*#([A-Za-z0-9_-]{4,64})").unwrap(),
            sample: "Re: #98765 agreed",
            expected: "98765",
        },
    ]
}

/// Run `matchers` in order over `text`; return the first hit and its name.
pub fn first_match(matchers: &[ReplyMatcher], text: &str) -> Option<(&'static str, String)> {
    matchers
        .iter()
        .find_map(|m| m.extract(text).map(|id| (m.name, id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(name: &str) -> ReplyMatcher {
        default_matchers()
            .into_iter()
            .find(|m| m.name == name)
            .unwrap()
    }

    #[test]
    fn all_samples_pass() {
        for m in default_matchers() {
            assert!(m.self_test(), "{} failed its sample", m.name);
        }
    }

    #[test]
    fn ref_token_extracts_id() {
        let m = matcher("ref_token");
        assert_eq!(m.extract(&ref_token("abc_123-X")).as_deref(), Some("abc_123-X"));
        assert_eq!(m.extract("[ref:]"), None);
        assert_eq!(m.extract("no token here"), None);
    }

    #[test]
    fn jump_link_variants() {
        let m = matcher("discord_jump_link");
        assert_eq!(
            m.extract("https://canary.discord.com/channels/1/2/3").as_deref(),
            Some("3")
        );
        assert_eq!(
            m.extract("https://discordapp.com/channels/@me/2/99").as_deref(),
            Some("99")
        );
        assert_eq!(m.extract("https://example.com/channels/1/2/3"), None);
    }

    #[test]
    fn reply_marker_is_case_insensitive() {
        let m = matcher("reply_marker");
        assert_eq!(m.extract("REPLY TO #abcd1").as_deref(), Some("abcd1"));
        assert_eq!(m.extract("re #12"), None, "too short to be an id");
        assert_eq!(m.extract("here #12345"), None, "needs a word boundary");
    }

    #[test]
    fn first_match_respects_order() {
        let matchers = default_matchers();
        let text = "re #99999 and [ref:11111]";
        assert_eq!(
            first_match(&matchers, text),
            Some(("ref_token", "11111".to_string()))
        );
        assert_eq!(first_match(&matchers, "nothing"), None);
    }
}
