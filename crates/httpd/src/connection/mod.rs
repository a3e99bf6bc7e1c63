//! Per-socket HTTP connection state.
//!
//! An [`HttpConn`] bundles one accepted socket with its read buffer, write buffer and
//! the request/response pair in flight. The reactor thread creates and re-initializes
//! connections; a worker thread drives one through `read`, `process` and `write`
//! while the socket is disarmed in the interest set, so no two tasks ever touch the
//! same connection at once.
//!
//! [`ConnContext`] carries what all connections of a server share: the resource
//! directory, the trigger mode, the user pool and the live connection counter.

mod http_conn;

pub use http_conn::ConnContext;
pub use http_conn::HttpConn;
