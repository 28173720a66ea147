//! Policy decisions for externally visible mutations.
//!
//! [`PolicyGate`] is a pure function from (operation, destructiveness, approval)
//! to a [`PolicyDecision`]. [`GatedConnector`] is the only path from the
//! pipeline to a [`Connector`]: it consults the gate with the same approval
//! and never dispatches a denied mutation.

pub mod connector;
pub mod gate;
pub mod mutation;

pub use connector::{Connector, GatedConnector, MutationOutcome, RecordingConnector};
pub use gate::{required_scope, DecisionReason, OperationType, PolicyDecision, PolicyGate};
pub use mutation::Mutation;
