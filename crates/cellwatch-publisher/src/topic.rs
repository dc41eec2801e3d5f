//! Topic namespace handling and filter matching.

/// Prepends the namespace prefix and a `/` to a relative topic.
///
/// Plain concatenation: an empty prefix leaves the topic unchanged and
/// separators already present on either side are kept as given.
pub fn qualify(prefix: &str, topic: &str) -> String {
    if prefix.is_empty() {
        return topic.to_string();
    }
    format!("{prefix}/{topic}")
}

/// Removes the namespace prefix from a full topic, if present.
pub fn strip<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(topic);
    }
    topic.strip_prefix(prefix)?.strip_prefix('/')
}

/// Matches a topic against a subscription filter.
///
/// `+` matches exactly one level, `#` matches the remaining levels
/// (including none) and is only valid as the last level.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// True if the filter uses wildcards correctly.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}
