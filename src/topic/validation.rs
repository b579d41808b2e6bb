//! Topic name and filter validation and matching
//!
//! Key rules:
//! - Topic names (PUBLISH) MUST NOT contain wildcards (+ or #)
//! - Topic filters (SUBSCRIBE) MAY contain wildcards
//! - Multi-level wildcard (#) must be the last character, preceded by /
//!   or the entire filter
//! - Single-level wildcard (+) must occupy an entire level

/// Check whether a topic string contains wildcard characters
#[inline]
pub fn has_wildcards(topic: &str) -> bool {
    topic.contains('+') || topic.contains('#')
}

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if has_wildcards(topic) {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            // # must be the entire level and the last level
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') {
            // + must be the entire level
            if *level != "+" {
                return Err("single-level wildcard must occupy entire level");
            }
        }
    }

    Ok(())
}

/// Check if a topic filter matches a concrete topic name.
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more trailing levels
/// - a filter starting with / only matches names starting with /
///
/// Namespace separation (user vs. `$SYS/...`) is handled by the
/// subscription engine, so no `$` special-casing happens here.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            // # matches everything remaining, including zero levels
            return true;
        }

        if ti >= topic_levels.len() {
            // No more topic levels but filter has more non-# levels
            return false;
        }

        if filter_level == "+" {
            ti += 1;
            fi += 1;
        } else if filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    // Both must be exhausted for a match
    ti == topic_levels.len()
}

/// Offset of the first wildcard character, used to rank how specific a
/// filter is. A filter without wildcards is the most specific; between two
/// filters whose first wildcard sits at the same offset, `+` ranks above `#`.
pub fn specificity(filter: &str) -> (usize, u8) {
    match filter.find(['+', '#']) {
        None => (usize::MAX, 2),
        Some(pos) => {
            let rank = if filter.as_bytes()[pos] == b'+' { 1 } else { 0 };
            (pos, rank)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test#topic").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test").is_ok());
        assert!(validate_topic_filter("test/topic").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("+/test").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("+test").is_err());
    }

    #[test]
    fn test_topic_matches() {
        // Reflexive on concrete topics
        assert!(topic_matches_filter("test", "test"));
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));

        // Single-level wildcard
        assert!(topic_matches_filter("test/topic", "test/+"));
        assert!(topic_matches_filter("test/topic", "+/topic"));
        assert!(topic_matches_filter("test/topic", "+/+"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("test", "+/+"));
        assert!(!topic_matches_filter("test/topic/extra", "test/+"));

        // Multi-level wildcard
        assert!(topic_matches_filter("test", "#"));
        assert!(topic_matches_filter("test/topic", "#"));
        assert!(topic_matches_filter("test/topic/more", "#"));
        assert!(topic_matches_filter("test/topic", "test/#"));
        assert!(topic_matches_filter("test/topic/more", "test/#"));
        assert!(topic_matches_filter("test", "test/#"));
        assert!(!topic_matches_filter("other/topic", "test/#"));

        // Leading separator is a level of its own
        assert!(topic_matches_filter("/test", "/#"));
        assert!(topic_matches_filter("/test", "/+"));
        assert!(!topic_matches_filter("test", "/#"));
        assert!(!topic_matches_filter("test", "/+"));
    }

    #[test]
    fn test_specificity_ordering() {
        // Exact beats any wildcard
        assert!(specificity("a/b/c") > specificity("a/b/+"));
        // Later wildcard beats earlier wildcard
        assert!(specificity("a/b/+") > specificity("a/+/c"));
        // At the same offset, + beats #
        assert!(specificity("a/+") > specificity("a/#"));
    }
}
