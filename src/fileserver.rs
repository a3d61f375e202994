//! Static HTTP server exposing the saved video files for download.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::device::list_saved_files;
use crate::error::Result;

type Body = UnsyncBoxBody<Bytes, io::Error>;

pub struct FileServer {
    root: Arc<PathBuf>,
    port: u16,
}

impl FileServer {
    pub fn new(root: PathBuf, port: u16) -> Self {
        Self {
            root: Arc::new(root),
            port,
        }
    }

    /// Serves files until Ctrl+C (or SIGINT from the supervisor).
    pub async fn run(self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.as_path()).await?;
        info!(
            "Serving static files from directory: {}",
            self.root.display()
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        info!("Static server STARTED at port {}", self.port);

        tokio::select! {
            result = accept_loop(listener, self.root.clone()) => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutting down static file server"),
        }
        info!("Server shut down correctly");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, root: Arc<PathBuf>) -> Result<()> {
    loop {
        let (stream, client) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let root = root.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let root = root.clone();
                async move { Ok::<_, Infallible>(handle_request(req, &root).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                // Happens whenever a download is interrupted
                debug!("File request interrupted [client: {}]: {}", client, e);
            }
        });
    }
}

async fn handle_request(req: Request<hyper::body::Incoming>, root: &Path) -> Response<Body> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let path = req.uri().path();
    if path == "/" {
        let listing = render_listing(&list_saved_files(root));
        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full(listing))
            .unwrap_or_else(|_| internal_error());
    }

    let Some(file) = resolve_path(root, path) else {
        return text_response(StatusCode::NOT_FOUND, "Not found");
    };
    match open_file(&file).await {
        Ok(Some((handle, length))) => {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().replace('"', "_"))
                .unwrap_or_default();
            let body = StreamBody::new(ReaderStream::new(handle).map_ok(Frame::data));
            Response::builder()
                .status(StatusCode::OK)
                // Force browsers to download the videos
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", name))
                .header(CONTENT_LENGTH, length)
                .body(body.boxed_unsync())
                .unwrap_or_else(|_| internal_error())
        }
        Ok(None) => text_response(StatusCode::NOT_FOUND, "Not found"),
        Err(e) => {
            error!("Failed to open {}: {}", file.display(), e);
            internal_error()
        }
    }
}

/// Opens a regular file for streaming, with its size. `None` when there is
/// no such file.
async fn open_file(path: &Path) -> io::Result<Option<(tokio::fs::File, u64)>> {
    let handle = match tokio::fs::File::open(path).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let metadata = handle.metadata().await?;
    if !metadata.is_file() {
        return Ok(None);
    }
    Ok(Some((handle, metadata.len())))
}

/// Maps a request path onto a file under `root`, refusing anything that
/// would escape it.
fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if resolved == root {
        None
    } else {
        Some(resolved)
    }
}

/// Escapes text for HTML content and double-quoted attributes.
struct HtmlEscaped<'a>(&'a str);

impl fmt::Display for HtmlEscaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut last_end = 0;
        for (start, part) in self.0.match_indices(['<', '>', '&', '"']) {
            f.write_str(&self.0[last_end..start])?;
            f.write_str(match part {
                "<" => "&lt;",
                ">" => "&gt;",
                "&" => "&amp;",
                _ => "&quot;",
            })?;
            last_end = start + part.len();
        }
        f.write_str(&self.0[last_end..])
    }
}

fn render_listing(files: &[String]) -> String {
    let mut html = String::from("<html><head><title>Saved videos</title></head><body><ul>\n");
    for file in files {
        html.push_str(&format!("<li><a href=\"{0}\">{0}</a></li>\n", HtmlEscaped(file)));
    }
    html.push_str("</ul></body></html>\n");
    html
}

fn full(contents: impl Into<Bytes>) -> Body {
    Full::new(contents.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut response = Response::new(full(text));
    *response.status_mut() = status;
    response
}

fn internal_error() -> Response<Body> {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/tmp/saved_videos");
        assert_eq!(
            resolve_path(root, "/20210101_120000_1.mp4"),
            Some(PathBuf::from("/tmp/saved_videos/20210101_120000_1.mp4"))
        );
        assert_eq!(resolve_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_path(root, "/a/../../b"), None);
        assert_eq!(resolve_path(root, "/./"), None);
    }

    #[test]
    fn test_render_listing() {
        let html = render_listing(&["a.mp4".to_string(), "b.mp4".to_string()]);
        assert!(html.contains("<a href=\"a.mp4\">a.mp4</a>"));
        assert!(html.find("a.mp4").unwrap() < html.find("b.mp4").unwrap());
    }

    #[test]
    fn test_listing_escapes_names() {
        let html = render_listing(&["a\"><script>&.mp4".to_string()]);
        assert!(html.contains("href=\"a&quot;&gt;&lt;script&gt;&amp;.mp4\""));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_html_escaped() {
        assert_eq!(format!("{}", HtmlEscaped("")), "");
        assert_eq!(format!("{}", HtmlEscaped("clip_1.mp4")), "clip_1.mp4");
        assert_eq!(
            format!("{}", HtmlEscaped("a <tag> & \"text\"")),
            "a &lt;tag&gt; &amp; &quot;text&quot;"
        );
    }

    #[tokio::test]
    async fn test_serves_saved_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"mp4 data").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_loop(listener, Arc::new(dir.path().to_path_buf())));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /clip.mp4 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("application/octet-stream"));
        assert!(response.to_ascii_lowercase().contains("content-length: 8"));
        assert!(response.ends_with("mp4 data"));
        server.abort();
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_directories_and_missing_files_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_loop(listener, Arc::new(dir.path().to_path_buf())));

        assert!(get(addr, "/nested").await.starts_with("HTTP/1.1 404"));
        assert!(get(addr, "/missing.mp4").await.starts_with("HTTP/1.1 404"));
        assert!(get(addr, "/").await.starts_with("HTTP/1.1 200"));
        server.abort();
    }
}
