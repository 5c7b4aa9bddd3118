// crates/stage-relay-core/src/lib.rs
// ============================================================================
// Module: Stage Relay Core Library
// Description: Public API surface for the Stage Relay core.
// Purpose: Expose pipeline types, interfaces, and the dispatcher state machine.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Stage Relay core provides the routing and cascading-invalidation logic for a
//! multi-stage preprocessing pipeline. It is transport-agnostic: the dispatcher
//! talks to the message bus and the revision store through explicit interfaces
//! so the state machine can be exercised without a broker.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::BusError;
pub use interfaces::Delivery;
pub use interfaces::DeliveryTag;
pub use interfaces::MessageBus;
pub use interfaces::OutboundMessage;
pub use interfaces::RevisionStore;
pub use interfaces::StoreError;
pub use runtime::Diagnostic;
pub use runtime::DiagnosticKind;
pub use runtime::DispatchError;
pub use runtime::DispatchOutcome;
pub use runtime::DispatchState;
pub use runtime::Dispatcher;
pub use runtime::InMemoryRevisionStore;
pub use runtime::SharedRevisionStore;
