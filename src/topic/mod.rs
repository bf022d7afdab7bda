//! Topic helpers
//!
//! Filter validation and matching, shared subscription parsing and the
//! generators that give every probe step its own topic and client
//! identifier so experiments never observe each other's traffic.

pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use uuid::Uuid;

/// Length of the topics probes use when no limit has been learned yet
pub const DEFAULT_TOPIC_LENGTH: usize = 32;

/// Parse a shared subscription filter.
///
/// Returns `(group, filter)` for `$share/{group}/{filter}`, or `None`.
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let (group, actual) = filter.strip_prefix("$share/")?.split_once('/')?;
    if group.is_empty() || actual.is_empty() {
        return None;
    }
    Some((group, actual))
}

/// Build a `$share/{group}/{filter}` subscription filter
pub fn shared_filter(group: &str, filter: &str) -> String {
    format!("$share/{}/{}", group, filter)
}

/// A string of exactly `len` lowercase hex characters, unique per call for
/// any `len` of 16 or more.
pub fn fresh_token(len: usize) -> String {
    let mut token = String::with_capacity(len + 32);
    while token.len() < len {
        token.push_str(&Uuid::new_v4().simple().to_string());
    }
    token.truncate(len);
    token
}

/// Single-level topic name of exactly `len` bytes.
pub fn fresh_topic(len: usize) -> String {
    fresh_token(len)
}

/// Alphanumeric client identifier of exactly `len` bytes.
pub fn fresh_client_id(len: usize) -> String {
    fresh_token(len)
}

/// Topic for a probe step, no longer than the learned topic limit.
pub fn probe_topic(max_len: Option<usize>) -> String {
    let len = max_len.map_or(DEFAULT_TOPIC_LENGTH, |max| max.min(DEFAULT_TOPIC_LENGTH));
    fresh_topic(len.max(1))
}

/// Per-run marker embedded in probe payloads
pub fn probe_marker() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_parse_shared_subscription() {
        assert_eq!(
            parse_shared_subscription("$share/group/base/+"),
            Some(("group", "base/+"))
        );
        assert_eq!(parse_shared_subscription("base/+"), None);
        assert_eq!(parse_shared_subscription("$share/group"), None);
        assert_eq!(parse_shared_subscription("$share//base"), None);
        assert_eq!(parse_shared_subscription("$share/group/"), None);
    }

    #[test]
    fn test_shared_filter_roundtrip() {
        let filter = shared_filter("probe", "abc");
        assert_eq!(filter, "$share/probe/abc");
        assert_eq!(parse_shared_subscription(&filter), Some(("probe", "abc")));
    }

    #[test]
    fn test_fresh_token_lengths() {
        for len in [0, 1, 31, 32, 33, 100, 65535] {
            let token = fresh_token(len);
            assert_eq!(token.len(), len);
            assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_fresh_topics_are_valid_and_unique() {
        let topics: HashSet<String> = (0..50).map(|_| fresh_topic(24)).collect();
        assert_eq!(topics.len(), 50);
        for topic in &topics {
            assert!(validate_topic_name(topic).is_ok());
            assert!(!topic.contains('/'));
        }
    }

    #[test]
    fn test_probe_topic_respects_learned_limit() {
        assert_eq!(probe_topic(None).len(), DEFAULT_TOPIC_LENGTH);
        assert_eq!(probe_topic(Some(8)).len(), 8);
        assert_eq!(probe_topic(Some(1000)).len(), DEFAULT_TOPIC_LENGTH);
        assert_eq!(probe_topic(Some(0)).len(), 1);
    }
}
