//! Readiness multiplexing on top of Linux `epoll`.
//!
//! - [`Epoller`]: owns the interest set (`add`, `modify`, `delete`) and blocks in `wait`
//! - [`Events`]: the result set of the most recent wait, indexed by position
//! - [`Interest`]: `epoll` flag set used for registration and readiness alike
//! - [`Waker`]: `eventfd` handle used to interrupt a blocked wait from another thread
//!
//! No retry or backoff logic lives here. Callers interpret the reported flags
//! and decide what to do with each descriptor.

mod epoller;
mod waker;

pub use epoller::Epoller;
pub use epoller::Events;
pub use epoller::Interest;
pub use waker::Waker;
