use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid request line: {line:?}")]
    InvalidRequestLine { line: String },

    #[error("invalid http method: {method:?}")]
    InvalidMethod { method: String },

    #[error("invalid http version: {version:?}")]
    InvalidVersion { version: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },
}

impl ParseError {
    pub fn invalid_request_line<S: ToString>(line: S) -> Self {
        Self::InvalidRequestLine { line: line.to_string() }
    }

    pub fn invalid_method<S: ToString>(method: S) -> Self {
        Self::InvalidMethod { method: method.to_string() }
    }

    pub fn invalid_version<S: ToString>(version: S) -> Self {
        Self::InvalidVersion { version: version.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }
}
