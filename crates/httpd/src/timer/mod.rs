//! Idle-connection timeouts.
//!
//! The reactor thread owns one [`HeapTimer`]. It asks for the next deadline before
//! every wait, pushes a connection's deadline back whenever the connection shows
//! activity, and lets expired callbacks close the idle ones.

mod heap_timer;

pub use heap_timer::HeapTimer;
pub use heap_timer::TimeoutCallback;
pub use heap_timer::TimerId;
