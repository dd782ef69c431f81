//! State-change batcher — coalesces hub state-change events into
//! debounced `state_batch` frames instead of forwarding each one
//! individually.

pub mod batcher;

pub use batcher::StateBatcher;
