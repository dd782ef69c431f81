//! Hub session manager — an authenticated WebSocket client to the local
//! home-automation hub, doubling as an RPC multiplexer for other
//! components and a source of state-change events.

pub mod session;

pub use session::{HubEvent, HubSession};
