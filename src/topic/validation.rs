//! Topic name and filter checks
//!
//! Used by the simulated broker to decide what a subscription matches and by
//! the probes to sanity check the filters they build.

/// Validate a topic name used in PUBLISH.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > u16::MAX as usize {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE, including the
/// `$share/{group}/{filter}` form.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > u16::MAX as usize {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let filter = match filter.strip_prefix("$share/") {
        Some(rest) => {
            let (group, actual) = rest
                .split_once('/')
                .ok_or("invalid shared subscription format")?;
            if group.is_empty() || group.contains(['+', '#']) {
                return Err("invalid shared subscription group");
            }
            if actual.is_empty() {
                return Err("shared subscription filter cannot be empty");
            }
            actual
        }
        None => filter,
    };

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err("multi-level wildcard must be the entire last level");
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }
    Ok(())
}

/// Check whether a topic name matches a (non-shared) topic filter.
///
/// `$`-topics never match filters starting with a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("probe").is_ok());
        assert!(validate_topic_name("probe/test/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("probe/+").is_err());
        assert!(validate_topic_name("probe/#").is_err());
        assert!(validate_topic_name("pro\0be").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("base/+").is_ok());
        assert!(validate_topic_filter("base/#").is_ok());
        assert!(validate_topic_filter("+/+/x").is_ok());
        assert!(validate_topic_filter("$share/g1/base/+").is_ok());

        assert!(validate_topic_filter("base/#/x").is_err());
        assert!(validate_topic_filter("base#").is_err());
        assert!(validate_topic_filter("base/a+").is_err());
        assert!(validate_topic_filter("$share/g1").is_err());
        assert!(validate_topic_filter("$share//base").is_err());
        assert!(validate_topic_filter("$share/g1/").is_err());
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("base/test", "base/+"));
        assert!(topic_matches_filter("base/test/subtopic", "base/#"));
        assert!(topic_matches_filter("base", "base/#"));
        assert!(topic_matches_filter("base/test", "base/test"));

        assert!(!topic_matches_filter("base/test/subtopic", "base/+"));
        assert!(!topic_matches_filter("base", "base/+"));
        assert!(!topic_matches_filter("other/test", "base/#"));
        assert!(!topic_matches_filter("base/test", "base/test/x"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/uptime", "+/uptime"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/#"));
    }
}
