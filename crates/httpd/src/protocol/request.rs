//! Incremental HTTP request parser.
//!
//! [`HttpRequest::parse`] consumes CRLF-terminated lines from a read [`Buffer`] and moves
//! through [`ParseState`] strictly forward: request line, header lines, an optional
//! single-line body, done. A line without its CRLF yet stays in the buffer until more
//! bytes arrive; only the body may be the unterminated remainder of the buffer.
//!
//! Form posts (`application/x-www-form-urlencoded`) are decoded into key/value pairs,
//! and posts to the login and register pages are checked against the user pool, which
//! rewrites the path to the welcome or error page.

use std::collections::HashMap;

use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Version};
use mime::Mime;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::protocol::ParseError;
use crate::user::{UserPool, verify_user};

static REQUEST_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^ ]*) ([^ ]*) HTTP/([^ ]*)$").expect("request line pattern is valid"));

static HEADER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^:]*): ?(.*)$").expect("header line pattern is valid"));

/// Extensionless pages that are served from `<path>.html`.
const DEFAULT_HTML: [&str; 6] = ["/index", "/register", "/login", "/welcome", "/video", "/picture"];

const REGISTER_PAGE: &str = "/register.html";
const LOGIN_PAGE: &str = "/login.html";
const WELCOME_PAGE: &str = "/welcome.html";
const ERROR_PAGE: &str = "/error.html";

/// Position of the parser; it only ever moves down this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// A request being parsed, reusable across the requests of one connection.
///
/// Any token is accepted as the method. The method only matters for the body: forms
/// are decoded for `POST` and ignored otherwise.
#[derive(Debug)]
pub struct HttpRequest {
    state: ParseState,
    method: Method,
    path: String,
    version: Version,
    headers: HeaderMap,
    body: String,
    post: HashMap<String, String>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    /// An empty `GET` request waiting for its request line.
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: Method::GET,
            path: String::new(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: String::new(),
            post: HashMap::new(),
        }
    }

    /// Resets the parser for the next request on the same connection.
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = Method::GET;
        self.path.clear();
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.body.clear();
        self.post.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// A whole request has been parsed; the next `parse` call needs an `init` first.
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path after default-document rewriting.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The single body line, raw even when it was decoded as a form.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Decoded form value of `key`.
    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    /// Every decoded form field; empty unless the request was a form `POST`.
    pub fn form(&self) -> &HashMap<String, String> {
        &self.post
    }

    /// `Connection: keep-alive` on an HTTP/1.1 request.
    pub fn keep_alive(&self) -> bool {
        self.version == Version::HTTP_11
            && self
                .headers
                .get(header::CONNECTION)
                .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"keep-alive"))
    }

    /// Consumes as many complete lines from `buf` as possible.
    ///
    /// Returns `Ok(true)` once the request is complete and `Ok(false)` when more bytes
    /// are needed. `users` backs the login and register forms; without it they fail.
    pub fn parse(&mut self, buf: &mut Buffer, users: Option<&UserPool>) -> Result<bool, ParseError> {
        while !buf.is_empty() && self.state != ParseState::Finish {
            let line_end = buf.find_crlf();
            if line_end.is_none() && self.state != ParseState::Body {
                break;
            }

            let end = line_end.unwrap_or(buf.readable_bytes());
            let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
            // bytes left after this line and its CRLF
            let rest = buf.readable_bytes() - line_end.map_or(end, |end| end + 2);

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.parse_path();
                }
                ParseState::Headers => {
                    self.parse_header(&line);
                    if self.state == ParseState::Body && rest == 0 {
                        self.state = ParseState::Finish;
                    }
                }
                ParseState::Body => self.parse_body(line, users)?,
                ParseState::Finish => unreachable!("loop stops at finish"),
            }

            match line_end {
                Some(end) => buf.retrieve_until(end + 2),
                None => buf.retrieve_all(),
            }
        }

        debug!(method = %self.method, path = %self.path, version = ?self.version, state = ?self.state, "parsed request");
        Ok(self.state == ParseState::Finish)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let caps = REQUEST_LINE.captures(line).ok_or_else(|| ParseError::invalid_request_line(line))?;
        let (method, path, version) = (&caps[1], &caps[2], &caps[3]);

        self.method = Method::from_bytes(method.as_bytes()).ok().ok_or_else(|| ParseError::invalid_method(method))?;
        self.version = match version {
            "0.9" => Version::HTTP_09,
            "1.0" => Version::HTTP_10,
            "1.1" => Version::HTTP_11,
            _ => return Err(ParseError::invalid_version(version)),
        };
        path.clone_into(&mut self.path);
        self.state = ParseState::Headers;
        Ok(())
    }

    fn parse_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// A line that is not `name: value` ends the header section.
    fn parse_header(&mut self, line: &str) {
        let Some(caps) = HEADER_LINE.captures(line) else {
            self.state = ParseState::Body;
            return;
        };

        match (HeaderName::from_bytes(caps[1].as_bytes()), HeaderValue::from_str(&caps[2])) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => trace!(line, "skip invalid header"),
        }
    }

    fn parse_body(&mut self, line: String, users: Option<&UserPool>) -> Result<(), ParseError> {
        self.body = line;
        self.parse_post(users)?;
        self.state = ParseState::Finish;
        trace!(len = self.body.len(), "parsed body");
        Ok(())
    }

    fn parse_post(&mut self, users: Option<&UserPool>) -> Result<(), ParseError> {
        if self.method != Method::POST || !self.is_form() {
            return Ok(());
        }

        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(&self.body).map_err(ParseError::invalid_body)?;
        self.post.extend(pairs);

        let is_login = match self.path.as_str() {
            REGISTER_PAGE => false,
            LOGIN_PAGE => true,
            _ => return Ok(()),
        };
        let verified = users.is_some_and(|pool| {
            let name = self.post("username").unwrap_or_default();
            let password = self.post("password").unwrap_or_default();
            verify_user(pool, name, password, is_login)
        });
        self.path = if verified { WELCOME_PAGE } else { ERROR_PAGE }.to_owned();
        Ok(())
    }

    fn is_form(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Mime>().ok())
            .is_some_and(|mime| mime.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::MemoryUserDb;
    use indoc::indoc;

    fn buffer(text: &str) -> Buffer {
        let mut buf = Buffer::new();
        buf.append(text.replace('\n', "\r\n").as_bytes());
        buf
    }

    #[test]
    fn parse_keep_alive_get() {
        let mut buf = buffer(indoc! {"
            GET /index.html HTTP/1.1
            Host: 127.0.0.1:1316
            Connection: keep-alive

        "});

        let mut request = HttpRequest::new();
        assert!(request.parse(&mut buf, None).unwrap());
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.path(), "/index.html");
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.headers().get(header::HOST).unwrap(), "127.0.0.1:1316");
        assert!(request.keep_alive());
        assert!(buf.is_empty());
    }

    #[test]
    fn keep_alive_needs_http_11() {
        let mut buf = buffer(indoc! {"
            GET / HTTP/1.0
            Connection: keep-alive

        "});

        let mut request = HttpRequest::new();
        assert!(request.parse(&mut buf, None).unwrap());
        assert_eq!(request.version(), Version::HTTP_10);
        assert!(!request.keep_alive());
    }

    #[test]
    fn default_documents_are_rewritten() {
        for (path, expected) in [("/", "/index.html"), ("/register", "/register.html"), ("/picture", "/picture.html"), ("/other", "/other")] {
            let mut buf = buffer(&format!("GET {path} HTTP/1.1\n\n"));
            let mut request = HttpRequest::new();
            request.parse(&mut buf, None).unwrap();
            assert_eq!(request.path(), expected);
        }
    }

    #[test]
    fn incomplete_request_waits_for_more() {
        let mut buf = Buffer::new();
        buf.append(b"GET /index.html HTTP/1.1\r\nHost: loc");

        let mut request = HttpRequest::new();
        assert!(!request.parse(&mut buf, None).unwrap());
        assert_eq!(request.state(), ParseState::Headers);
        assert_eq!(buf.peek(), b"Host: loc");

        buf.append(b"alhost\r\n\r\n");
        assert!(request.parse(&mut buf, None).unwrap());
        assert_eq!(request.headers().get(header::HOST).unwrap(), "localhost");
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        let mut request = HttpRequest::new();
        let err = request.parse(&mut buffer("hello world\n\n"), None).unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine { .. }));

        request.init();
        let err = request.parse(&mut buffer("GET / HTTP/4.2\n\n"), None).unwrap_err();
        assert!(matches!(err, ParseError::InvalidVersion { .. }));
    }

    #[test]
    fn any_method_token_is_accepted() {
        let mut request = HttpRequest::new();
        assert!(request.parse(&mut buffer("HEAD /index HTTP/1.1\n\n"), None).unwrap());
        assert_eq!(request.method(), &Method::HEAD);
        assert_eq!(request.path(), "/index.html");

        request.init();
        let form = "PUT /submit HTTP/1.1\nContent-Type: application/x-www-form-urlencoded\n\ntitle=test";
        assert!(request.parse(&mut buffer(form), None).unwrap());
        assert_eq!(request.method().as_str(), "PUT");
        assert_eq!(request.body(), "title=test");
        assert!(request.form().is_empty());

        request.init();
        let err = request.parse(&mut buffer("G@T / HTTP/1.1\n\n"), None).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMethod { method } if method == "G@T"));
    }

    #[test]
    fn form_body_is_decoded() {
        let mut buf = buffer(indoc! {"
            POST /submit HTTP/1.1
            Content-Type: application/x-www-form-urlencoded
            Content-Length: 22

            title=test&sub%5B%5D=1"});

        let mut request = HttpRequest::new();
        assert!(request.parse(&mut buf, None).unwrap());
        assert_eq!(request.body(), "title=test&sub%5B%5D=1");
        assert_eq!(request.post("title"), Some("test"));
        assert_eq!(request.post("sub[]"), Some("1"));
        assert_eq!(request.form().len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn percent_escapes_decode_to_bytes() {
        let mut buf = buffer("POST /submit HTTP/1.1\nContent-Type: application/x-www-form-urlencoded\n\nname=a+b%21%0A\n");

        let mut request = HttpRequest::new();
        assert!(request.parse(&mut buf, None).unwrap());
        assert_eq!(request.post("name"), Some("a b!\n"));
    }

    #[test]
    fn non_form_body_is_kept_raw() {
        let mut buf = buffer("POST /submit HTTP/1.1\nContent-Type: text/plain\n\nkey=value");

        let mut request = HttpRequest::new();
        assert!(request.parse(&mut buf, None).unwrap());
        assert_eq!(request.body(), "key=value");
        assert!(request.form().is_empty());
    }

    #[test]
    fn login_form_rewrites_path() {
        let db = MemoryUserDb::with_users([("alice", "secret")]);
        let pool = db.pool(1).unwrap();
        let form = "POST /login HTTP/1.1\nContent-Type: application/x-www-form-urlencoded\n\n";

        let mut request = HttpRequest::new();
        request.parse(&mut buffer(&format!("{form}username=alice&password=secret")), Some(&pool)).unwrap();
        assert_eq!(request.path(), "/welcome.html");

        request.init();
        request.parse(&mut buffer(&format!("{form}username=alice&password=nope")), Some(&pool)).unwrap();
        assert_eq!(request.path(), "/error.html");

        request.init();
        request.parse(&mut buffer(&format!("{form}username=alice&password=secret")), None).unwrap();
        assert_eq!(request.path(), "/error.html");
    }

    #[test]
    fn register_form_inserts_user() {
        let db = MemoryUserDb::new();
        let pool = db.pool(1).unwrap();
        let mut buf =
            buffer("POST /register HTTP/1.1\nContent-Type: application/x-www-form-urlencoded\n\nusername=bob&password=pw");

        let mut request = HttpRequest::new();
        assert!(request.parse(&mut buf, Some(&pool)).unwrap());
        assert_eq!(request.path(), "/welcome.html");
        assert_eq!(db.len(), 1);
    }
}
