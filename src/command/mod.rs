//! Command executor — dispatches cloud-issued commands against the hub
//! and reports the outcome back through the shared cloud outbound
//! channel.

pub mod executor;

pub use executor::CommandExecutor;
