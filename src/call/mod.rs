//! Instant calls: a volunteer rings an online student, who can accept,
//! decline, or let the request time out.

mod orchestrator;

pub use orchestrator::{CallStatus, InstantCall, InstantCallOrchestrator};
