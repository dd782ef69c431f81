//! `helm-bridge` — a daemon bridging a local home-automation hub to the
//! Helm cloud service over two independently-managed WebSocket sessions.

pub mod backoff;
pub mod cloud;
pub mod command;
pub mod config;
pub mod credential;
pub mod error;
pub mod fullsync;
pub mod health;
pub mod hub;
pub mod orchestrator;
pub mod pairing;
pub mod protocol;
pub mod state;

pub use orchestrator::BridgeOrchestrator;
