//! Call-level façade over the signaling session and media coordinator

pub mod orchestrator;
pub mod state;

pub use orchestrator::CallOrchestrator;
pub use state::{
    CallDirection, CallPhase, CallState, IncomingCall, ParticipantSnapshot, RemoteMediaState,
};
