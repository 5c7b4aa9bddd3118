// crates/stage-relay-broker/tests/topic.rs
// ============================================================================
// Module: Topic Matching Tests
// Description: Binding pattern semantics of the topic exchange.
// Purpose: Validate `*` and `#` wildcards against relay routing keys.
// Dependencies: stage-relay-broker
// ============================================================================

//! ## Overview
//! Checks the wildcard rules the dispatcher and worker bindings rely on.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use stage_relay_broker::topic_matches;

// ============================================================================
// SECTION: Wildcards
// ============================================================================

/// Tests that `*` matches exactly one word.
#[test]
fn star_matches_exactly_one_word() {
    assert!(topic_matches("preprocessing.*", "preprocessing.heatflow"));
    assert!(!topic_matches("preprocessing.*", "preprocessing"));
    assert!(!topic_matches("preprocessing.*", "preprocessing.routing.done"));
}

/// Tests that `#` matches zero or more words.
#[test]
fn hash_matches_any_number_of_words() {
    assert!(topic_matches("preprocessing.#", "preprocessing"));
    assert!(topic_matches("preprocessing.#", "preprocessing.heatflow"));
    assert!(topic_matches("preprocessing.#", "preprocessing.routing.done"));
    assert!(topic_matches("#.done", "preprocessing.routing.done"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(!topic_matches("preprocessing.#", "other.heatflow"));
}

/// Tests that literal words must match exactly.
#[test]
fn literal_words_must_match() {
    assert!(topic_matches("preprocessing.routing.done", "preprocessing.routing.done"));
    assert!(!topic_matches("preprocessing.routing.done", "preprocessing.routing.failed"));
    assert!(!topic_matches("preprocessing.routing", "preprocessing.routing.done"));
}

// ============================================================================
// SECTION: Relay Bindings
// ============================================================================

/// Tests that dispatcher bindings split requests from completions.
#[test]
fn dispatcher_bindings_accept_requests_and_completions_only() {
    let request = "preprocessing.*";
    let completion = "preprocessing.*.done";
    assert!(topic_matches(request, "preprocessing.regrid"));
    assert!(topic_matches(completion, "preprocessing.regrid.done"));
    assert!(!topic_matches(request, "preprocessing.regrid.python"));
    assert!(!topic_matches(completion, "preprocessing.regrid.python"));
}

/// Tests that a worker binding only sees its own pool.
#[test]
fn worker_binding_selects_pool_segment() {
    let python = "preprocessing.*.python";
    assert!(topic_matches(python, "preprocessing.heatflow.python"));
    assert!(!topic_matches(python, "preprocessing.subbasins.panel"));
    assert!(!topic_matches(python, "preprocessing.heatflow.done"));
}
