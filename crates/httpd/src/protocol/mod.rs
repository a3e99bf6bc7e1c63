//! HTTP/1.1 request parsing and response building.
//!
//! - **Request**: [`HttpRequest`], a line-oriented parser driven by
//!   [`ParseState`], with default-document rewriting and form decoding
//! - **Response**: [`HttpResponse`], status resolution against the
//!   source directory, header serialization and the memory-mapped body
//! - **Errors**: [`ParseError`] for requests answered with `400 Bad Request`
//!
//! Both halves work on [`Buffer`](crate::buffer::Buffer)s owned by the connection and
//! never touch the socket themselves.

mod request;
pub use request::HttpRequest;
pub use request::ParseState;

mod response;
pub use response::HttpResponse;
pub use response::content_type;

mod error;
pub use error::ParseError;
