//! HTTP response building.
//!
//! [`HttpResponse::make_response`] resolves the requested file under the source
//! directory, writes the status line and headers into the write [`Buffer`], and maps
//! the file read-only so the connection can send header and body with one vectored
//! write. When the file cannot be opened or mapped, a small HTML error page is
//! appended to the buffer instead.

use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use http::StatusCode;
use memmap2::Mmap;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::buffer::Buffer;

/// Suffix to `Content-Type`, anything else is served as `text/plain`.
static SUFFIX_TYPE: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (".html", "text/html"),
        (".xml", "text/xml"),
        (".xhtml", "application/xhtml+xml"),
        (".txt", "text/plain"),
        (".rtf", "application/rtf"),
        (".pdf", "application/pdf"),
        (".png", "image/png"),
        (".gif", "image/gif"),
        (".jpg", "image/jpeg"),
        (".jpeg", "image/jpeg"),
        (".au", "audio/basic"),
        (".mpeg", "video/mpeg"),
        (".mpg", "video/mpeg"),
        (".avi", "video/x-msvideo"),
        (".gz", "application/x-gzip"),
        (".tar", "application/x-tar"),
        (".css", "text/css"),
        (".js", "text/javascript"),
    ])
});

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Status codes the server answers with.
const SUPPORTED_CODES: [StatusCode; 4] =
    [StatusCode::OK, StatusCode::BAD_REQUEST, StatusCode::FORBIDDEN, StatusCode::NOT_FOUND];

/// `Content-Type` of `path`, looked up by its last suffix.
pub fn content_type(path: &str) -> &'static str {
    path.rfind('.').and_then(|idx| SUFFIX_TYPE.get(&path[idx..]).copied()).unwrap_or(DEFAULT_CONTENT_TYPE)
}

fn error_page(code: StatusCode) -> Option<&'static str> {
    match code {
        StatusCode::BAD_REQUEST => Some("/400.html"),
        StatusCode::FORBIDDEN => Some("/403.html"),
        StatusCode::NOT_FOUND => Some("/404.html"),
        _ => None,
    }
}

/// Status line, headers and a memory-mapped body for one request.
#[derive(Debug, Default)]
pub struct HttpResponse {
    code: Option<StatusCode>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<Mmap>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the response for `path`, dropping any file mapped for the previous one.
    ///
    /// `code` is `None` (or 200) for a parsed request, whose status is then resolved
    /// from the file system. Any other code is answered as is.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) {
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        path.clone_into(&mut self.path);
        src_dir.clone_into(&mut self.src_dir);
    }

    /// Status of the response; for a parsed request `None` until [`HttpResponse::make_response`] resolves it.
    pub fn code(&self) -> Option<StatusCode> {
        self.code
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Path actually served, an error page once the status is not 200.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mapped body, empty when the body went into the write buffer.
    pub fn file(&self) -> &[u8] {
        self.file.as_deref().unwrap_or_default()
    }

    /// Length of the mapped body, 0 when nothing is mapped.
    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, |file| file.len())
    }

    /// Releases the mapping of the previous body.
    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    /// Writes status line, headers and, if the file cannot be mapped, the body into `buf`.
    pub fn make_response(&mut self, buf: &mut Buffer) -> io::Result<()> {
        let mut code = match self.code {
            None => StatusCode::OK,
            Some(code) if SUPPORTED_CODES.contains(&code) => code,
            Some(_) => StatusCode::BAD_REQUEST,
        };

        if code == StatusCode::OK {
            code = self.resolve_status();
        }
        if let Some(page) = error_page(code) {
            page.clone_into(&mut self.path);
        }
        self.code = Some(code);

        self.add_state_line(buf, code)?;
        self.add_header(buf)?;
        self.add_content(buf, code)
    }

    /// Appends the literal error page for the current status, with its `Content-Length`.
    pub fn error_content(&self, buf: &mut Buffer, message: &str) -> io::Result<()> {
        let code = self.code.unwrap_or(StatusCode::BAD_REQUEST);
        let reason = code.canonical_reason().unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {reason}\n<p>{message}</p><hr><em>TinyWebServer</em></body></html>",
            code.as_u16()
        );
        write!(buf, "Content-Length:{}\r\n\r\n", body.len())?;
        buf.append(body.as_bytes());
        Ok(())
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn resolve_status(&self) -> StatusCode {
        if self.path.split('/').any(|segment| segment == "..") {
            return StatusCode::FORBIDDEN;
        }
        match fs::metadata(self.full_path()) {
            Err(_) => StatusCode::NOT_FOUND,
            Ok(meta) if meta.is_dir() => StatusCode::NOT_FOUND,
            Ok(meta) if !is_world_readable(&meta) => StatusCode::FORBIDDEN,
            Ok(_) => StatusCode::OK,
        }
    }

    fn add_state_line(&self, buf: &mut Buffer, code: StatusCode) -> io::Result<()> {
        write!(buf, "HTTP/1.1 {} {}\r\n", code.as_str(), code.canonical_reason().unwrap_or("Bad Request"))
    }

    fn add_header(&self, buf: &mut Buffer) -> io::Result<()> {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        write!(buf, "Content-Type: {}\r\n", content_type(&self.path))
    }

    fn add_content(&mut self, buf: &mut Buffer, code: StatusCode) -> io::Result<()> {
        let path = self.full_path();
        let mapped = File::open(&path).and_then(|file| {
            let len = file.metadata()?.len();
            if len == 0 {
                return Ok(None);
            }
            // SAFETY: the file is opened read-only and served files are not truncated while mapped.
            let mmap = unsafe { Mmap::map(&file)? };
            Ok(Some(mmap))
        });

        match mapped {
            Ok(file) => {
                let len = file.as_ref().map_or(0, |file| file.len());
                debug!(path = %path.display(), len, code = code.as_u16(), "map response file");
                self.file = file;
                write!(buf, "Content-Length:{len}\r\n\r\n")
            }
            Err(e) => {
                warn!(path = %path.display(), cause = %e, "failed to map response file");
                self.error_content(buf, "File NotFound!")
            }
        }
    }
}

fn is_world_readable(meta: &Metadata) -> bool {
    meta.permissions().mode() & u32::from(libc::S_IROTH) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::fs::Permissions;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str, mode: u32) {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
    }

    fn resources() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "index.html", "<h1>hello</h1>", 0o644);
        write_file(dir.path(), "403.html", "forbidden", 0o644);
        write_file(dir.path(), "empty.txt", "", 0o644);
        write_file(dir.path(), "style.css", "body {}", 0o644);
        fs::create_dir(dir.path().join("assets")).unwrap();
        dir
    }

    fn respond(dir: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) -> (HttpResponse, String) {
        let mut response = HttpResponse::new();
        response.init(dir, path, keep_alive, code);
        let mut buf = Buffer::new();
        response.make_response(&mut buf).unwrap();
        (response, buf.retrieve_all_to_string())
    }

    #[test]
    fn serves_mapped_file() {
        let dir = resources();
        let (response, head) = respond(dir.path(), "/index.html", true, None);

        let expected = indoc! {"
            HTTP/1.1 200 OK
            Connection: keep-alive
            keep-alive: max=6, timeout=120
            Content-Type: text/html
            Content-Length:14

        "};
        assert_eq!(head, expected.replace('\n', "\r\n"));
        assert_eq!(response.code(), Some(StatusCode::OK));
        assert_eq!(response.file(), b"<h1>hello</h1>");
        assert_eq!(response.file_len(), 14);
    }

    #[test]
    fn missing_file_gets_literal_404_page() {
        let dir = resources();
        let (response, text) = respond(dir.path(), "/missing.html", false, None);

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\nConnection: close\r\n"));
        assert!(text.contains("404 : Not Found"));
        assert!(text.contains("<p>File NotFound!</p>"));
        assert_eq!(response.path(), "/404.html");
        assert!(response.file().is_empty());

        let body = text.split("\r\n\r\n").nth(1).unwrap();
        assert!(text.contains(&format!("Content-Length:{}\r\n", body.len())));
    }

    #[test]
    fn directory_is_not_found() {
        let dir = resources();
        let (response, _) = respond(dir.path(), "/assets", false, None);
        assert_eq!(response.code(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let dir = resources();
        write_file(dir.path(), "secret.html", "top secret", 0o600);

        let (response, text) = respond(dir.path(), "/secret.html", false, None);
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(response.path(), "/403.html");
        assert_eq!(response.file(), b"forbidden");
    }

    #[test]
    fn parent_segment_is_forbidden() {
        let dir = resources();
        let (response, _) = respond(&dir.path().join("assets"), "/../index.html", false, None);
        assert_eq!(response.code(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn bad_request_is_not_resolved() {
        let dir = resources();
        let (response, text) = respond(dir.path(), "/index.html", false, Some(StatusCode::BAD_REQUEST));
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("400 : Bad Request"));
        assert_eq!(response.path(), "/400.html");
    }

    #[test]
    fn unsupported_code_becomes_bad_request() {
        let dir = resources();
        let (response, _) = respond(dir.path(), "/index.html", false, Some(StatusCode::IM_A_TEAPOT));
        assert_eq!(response.code(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn empty_file_has_zero_length() {
        let dir = resources();
        let (response, text) = respond(dir.path(), "/empty.txt", false, None);
        assert!(text.ends_with("Content-Type: text/plain\r\nContent-Length:0\r\n\r\n"));
        assert!(response.file().is_empty());
    }

    #[test]
    fn init_releases_previous_mapping() {
        let dir = resources();
        let (mut response, _) = respond(dir.path(), "/style.css", false, None);
        assert_eq!(response.file(), b"body {}");

        response.init(dir.path(), "/index.html", false, None);
        assert_eq!(response.file_len(), 0);
    }

    #[test]
    fn content_type_by_suffix() {
        assert_eq!(content_type("/a/b.jpeg"), "image/jpeg");
        assert_eq!(content_type("/style.css"), "text/css");
        assert_eq!(content_type("/archive.tar.gz"), "application/x-gzip");
        assert_eq!(content_type("/README"), "text/plain");
        assert_eq!(content_type("/file.unknown"), "text/plain");
    }
}
