// crates/stage-relay-core/src/runtime/mod.rs
// ============================================================================
// Module: Stage Relay Runtime
// Description: Dispatcher state machine and in-memory revision store.
// Purpose: Execute routing and cascading against pluggable bus and store backends.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Runtime modules implement the dispatcher cycle and the reference revision
//! store. Transports and durable stores live in sibling crates and plug in
//! through [`crate::interfaces`].

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod dispatcher;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use dispatcher::Diagnostic;
pub use dispatcher::DiagnosticKind;
pub use dispatcher::DispatchError;
pub use dispatcher::DispatchOutcome;
pub use dispatcher::DispatchState;
pub use dispatcher::Dispatcher;
pub use store::InMemoryRevisionStore;
pub use store::SharedRevisionStore;
