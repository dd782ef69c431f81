//! Cloud session manager — the authenticated WebSocket client to the
//! Helm cloud service, and the single point every other outbound frame
//! (state batches, full syncs, command acks/results, heartbeats) funnels
//! through on its way to the wire.

pub mod session;

pub use session::{CloudEvent, CloudSession};
