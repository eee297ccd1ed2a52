//! Static file responses for non-upgrade requests.
//!
//! Serves files beneath a configured root with strong etags
//! (`"<len>-<mtime>"`), `If-None-Match` 304 handling, and extension-based
//! MIME types. Requests escaping the root are refused with 403. With no
//! root configured every path is a 404.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Reason phrase for the status codes this server emits.
fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Build a minimal plain-text response.
pub fn simple_response(status: u16, body: &str) -> Vec<u8> {
    let body = format!("{body}\n");
    format!(
        "HTTP/1.1 {status} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        reason(status),
        body.len(),
    )
    .into_bytes()
}

/// Serve `path` from `root`, honoring `If-None-Match`.
///
/// Always returns a complete response; faults map to 403/404/500.
pub fn serve(root: Option<&Path>, path: &str, if_none_match: Option<&str>) -> Vec<u8> {
    let Some(root) = root else {
        return simple_response(404, "Not Found");
    };

    let resolved = match resolve(root, path) {
        Ok(p) => p,
        Err(status) => return simple_response(status, reason(status)),
    };

    let metadata = match fs::metadata(&resolved) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return simple_response(404, "Not Found"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return simple_response(404, "Not Found");
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return simple_response(403, "Forbidden");
        }
        Err(_) => return simple_response(500, "Internal Server Error"),
    };

    let etag = etag_for(&metadata);
    if if_none_match == Some(etag.as_str()) {
        return format!(
            "HTTP/1.1 304 Not Modified\r\nETag: {etag}\r\nConnection: close\r\n\r\n"
        )
        .into_bytes();
    }

    let body = match fs::read(&resolved) {
        Ok(b) => b,
        Err(_) => return simple_response(500, "Internal Server Error"),
    };

    let mime = mime_for(&resolved);
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {mime}\r\n\
         Content-Length: {}\r\n\
         ETag: {etag}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len(),
    )
    .into_bytes();
    response.extend_from_slice(&body);
    response
}

/// Map a request path to a file under the root, rejecting traversal.
fn resolve(root: &Path, path: &str) -> Result<PathBuf, u16> {
    let trimmed = path.trim_start_matches('/');
    let relative = if trimmed.is_empty() { "index.html" } else { trimmed };

    let candidate = Path::new(relative);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            // "..", absolute prefixes, and the like escape the root.
            _ => return Err(403),
        }
    }

    Ok(root.join(candidate))
}

/// Strong etag from file length and mtime.
fn etag_for(metadata: &fs::Metadata) -> String {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    format!("\"{}-{}\"", metadata.len(), mtime)
}

/// MIME type by file extension.
fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("wasm") => "application/wasm",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn response_status(response: &[u8]) -> u16 {
        let text = std::str::from_utf8(&response[..20]).expect("ascii head");
        text.split_whitespace()
            .nth(1)
            .expect("status")
            .parse()
            .expect("numeric status")
    }

    #[test]
    fn no_root_is_404() {
        assert_eq!(response_status(&serve(None, "/index.html", None)), 404);
    }

    #[test]
    fn serves_existing_file_with_mime() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut f = fs::File::create(tmp.path().join("app.js")).expect("create");
        f.write_all(b"console.log(1)").expect("write");
        drop(f);

        let response = serve(Some(tmp.path()), "/app.js", None);
        assert_eq!(response_status(&response), 200);
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("Content-Type: text/javascript"));
        assert!(text.contains("console.log(1)"));
    }

    #[test]
    fn root_path_serves_index() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("index.html"), b"<html></html>").expect("write");

        let response = serve(Some(tmp.path()), "/", None);
        assert_eq!(response_status(&response), 200);
        assert!(String::from_utf8_lossy(&response).contains("text/html"));
    }

    #[test]
    fn missing_file_is_404() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(response_status(&serve(Some(tmp.path()), "/nope.css", None)), 404);
    }

    #[test]
    fn traversal_is_403() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let response = serve(Some(tmp.path()), "/../../etc/passwd", None);
        assert_eq!(response_status(&response), 403);
    }

    #[test]
    fn etag_match_is_304() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("style.css"), b"body{}").expect("write");
        let metadata = fs::metadata(tmp.path().join("style.css")).expect("metadata");
        let etag = etag_for(&metadata);

        let response = serve(Some(tmp.path()), "/style.css", Some(etag.as_str()));
        assert_eq!(response_status(&response), 304);
    }

    #[test]
    fn etag_mismatch_serves_body() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("style.css"), b"body{}").expect("write");

        let response = serve(Some(tmp.path()), "/style.css", Some("\"stale\""));
        assert_eq!(response_status(&response), 200);
    }

    #[test]
    fn unknown_extension_is_octet_stream() {
        assert_eq!(mime_for(Path::new("data.bin")), "application/octet-stream");
    }
}
