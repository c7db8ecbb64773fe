//! Call-level signaling session
//!
//! Owns the per-peer records of one call, routes inbound signaling messages
//! to them and publishes state changes and events.

pub mod event;
pub mod signaling;
pub mod state;

pub use event::{CallSession, SignalingEvent, SignalingEventKind};
pub use signaling::{SignalingSession, CONTROL_CHANNEL};
pub use state::{SignalingState, SignalingStateMachine, SignalingTrigger, StateChange};
