// crates/stage-relay-broker/src/topic.rs
// ============================================================================
// Module: Stage Relay Topic Matching
// Description: AMQP 0-9-1 topic exchange binding semantics.
// Purpose: Decide which queue bindings a routing key reaches.
// Dependencies: std
// ============================================================================

//! ## Overview
//! Routing keys and binding patterns are dot-separated words. In a pattern,
//! `*` matches exactly one word and `#` matches zero or more words. Every
//! other word must match literally.

// ============================================================================
// SECTION: Matching
// ============================================================================

/// Returns true when `routing_key` matches the binding `pattern`.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_segments(&pattern, &key)
}

/// Matches pattern words against key words.
fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0 ..= key.len())
            .any(|skip| key.get(skip ..).is_some_and(|tail| matches_segments(rest, tail))),
        Some((&"*", rest)) => {
            key.split_first().is_some_and(|(_, tail)| matches_segments(rest, tail))
        }
        Some((word, rest)) => key
            .split_first()
            .is_some_and(|(head, tail)| head == word && matches_segments(rest, tail)),
    }
}
