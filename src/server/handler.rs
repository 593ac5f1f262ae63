//! Per-connection request lifecycle.
//!
//! One handler invocation owns the connection from first read to close:
//! read the request head, parse, resolve against the document root
//! through the worker's cache, write exactly one response, record one
//! stats update and one access-log line, and drop the stream.

use std::path::PathBuf;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::access_log::AccessEntry;
use crate::http::{
    Method, Request, ResponseHead, content_type_for, error_page, reason_phrase,
};
use crate::stats::StatsReport;

use super::worker::{Job, WorkerContext};

/// Request head buffer size; heads larger than this are malformed.
const HEAD_BUFFER_SIZE: usize = 8192;

/// What one request resolved to, for the stats and log epilogue.
struct Outcome {
    status: u16,
    /// Entity bytes actually written (0 for HEAD and failed writes).
    bytes: u64,
    method: String,
    path: String,
}

/// Handles one connection to completion.
pub(crate) async fn handle_request(ctx: &WorkerContext, job: Job) {
    let Job { mut stream, peer } = job;
    ctx.stats.connection_opened();
    let started = Instant::now();

    // A connection that closes or fails before a complete head arrives
    // produces no response, no stats record, and no log line.
    if let Some(head) = read_head(&mut stream).await {
        let outcome = match Request::parse(&head) {
            Ok(request) => serve(ctx, &mut stream, &request).await,
            Err(error) => {
                debug!(peer = %peer, %error, "malformed request");
                let bytes = write_error(&mut stream, 400, false).await;
                let (method, path) = salvage_request_line(&head);
                Outcome {
                    status: 400,
                    bytes,
                    method,
                    path,
                }
            }
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        ctx.stats.record(outcome.status, outcome.bytes, duration_ms);
        ctx.log.log(&AccessEntry {
            remote_addr: peer.ip(),
            method: &outcome.method,
            path: &outcome.path,
            status: outcome.status,
            bytes: outcome.bytes,
            duration_ms,
        });
        trace!(
            worker_id = ctx.worker_id,
            peer = %peer,
            status = outcome.status,
            bytes = outcome.bytes,
            duration_ms,
            "request complete"
        );
    }

    let _ = stream.shutdown().await;
    ctx.stats.connection_closed();
}

/// Writes the saturation response used by both the acceptor (admission
/// queue full) and the worker receiver (job queue full). Best effort;
/// the stream is closed either way.
pub(crate) async fn write_service_unavailable(stream: &mut TcpStream) {
    let _ = write_error(stream, 503, false).await;
    let _ = stream.shutdown().await;
}

/// Reads until the head terminator or a full buffer. Returns `None` on
/// EOF or socket error before a complete head.
async fn read_head(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; HEAD_BUFFER_SIZE];
    let mut filled = 0;

    loop {
        match stream.read(&mut buffer[filled..]).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => filled += n,
        }
        if let Some(end) = find_head_end(&buffer[..filled]) {
            // Drop anything past the terminator (an entity body is never
            // read) so the parser sees exactly the head.
            buffer.truncate(end + 4);
            return Some(buffer);
        }
        if filled == buffer.len() {
            // No terminator within the buffer; hand the prefix to the
            // parser, which will answer 400 for anything nonsensical.
            return Some(buffer);
        }
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Best-effort method/path recovery from an unparseable head, for the
/// access log. The log sanitizes whatever is recovered, so raw tokens
/// are fine here.
fn salvage_request_line(head: &[u8]) -> (String, String) {
    let first_line = head
        .split(|&b| b == b'\r' || b == b'\n')
        .next()
        .unwrap_or_default();
    let text = String::from_utf8_lossy(first_line);
    let mut parts = text.split_whitespace();
    let method = parts.next().unwrap_or("BAD").to_string();
    let path = parts.next().unwrap_or("-").to_string();
    (method, path)
}

/// Serves a parsed request and returns the outcome for the epilogue.
async fn serve(ctx: &WorkerContext, stream: &mut TcpStream, request: &Request) -> Outcome {
    let method = request.method.as_str().to_string();
    let path = request.path().to_string();
    let outcome = |status, bytes| Outcome {
        status,
        bytes,
        method: method.clone(),
        path: path.clone(),
    };

    if let Method::Other(token) = &request.method {
        debug!(method = %token, "method not allowed");
        let bytes = write_error(stream, 405, false).await;
        return outcome(405, bytes);
    }
    let head_only = request.method == Method::Head;

    if path == "/api/stats" {
        let bytes = serve_stats(ctx, stream, head_only).await;
        return outcome(200, bytes);
    }

    let relative = if path == "/" { "/index.html" } else { path.as_str() };
    if relative.contains("..") {
        debug!(path = %relative, "path traversal rejected");
        let bytes = write_error(stream, 403, head_only).await;
        return outcome(403, bytes);
    }

    let absolute = PathBuf::from(format!(
        "{}{relative}",
        ctx.document_root.display()
    ));

    let handle = match ctx.cache.acquire(relative) {
        Some(handle) => handle,
        None => {
            // Probe before loading so a plain missing file is a 404, not
            // a read error.
            match tokio::fs::metadata(&absolute).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => {
                    let bytes = write_error(stream, 404, head_only).await;
                    return outcome(404, bytes);
                }
                Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => {
                    let bytes = write_error(stream, 403, head_only).await;
                    return outcome(403, bytes);
                }
                Err(_) => {
                    let bytes = write_error(stream, 404, head_only).await;
                    return outcome(404, bytes);
                }
            }
            match ctx.cache.load(relative, &absolute).await {
                Ok(handle) => handle,
                Err(error) => {
                    let status = if error.is_permission_denied() { 403 } else { 500 };
                    debug!(path = %absolute.display(), %error, "file load failed");
                    let bytes = write_error(stream, status, head_only).await;
                    return outcome(status, bytes);
                }
            }
        }
    };

    let content_type = content_type_for(relative);
    let size = handle.size();

    if let Some(spec) = request.range {
        let Some(range) = spec.resolve(size) else {
            let bytes = write_error(stream, 416, head_only).await;
            return outcome(416, bytes);
        };
        let head = ResponseHead::partial(content_type, range, size);
        // The entity fits in memory, so the range bounds fit in usize.
        let body = &handle.bytes()[range.start as usize..=range.end as usize];
        let bytes = write_response(stream, &head, body, head_only).await;
        return outcome(206, bytes);
    }

    let head = ResponseHead::new(200, content_type, size);
    let bytes = write_response(stream, &head, handle.bytes(), head_only).await;
    outcome(200, bytes)
}

/// Builds and writes the aggregated statistics document.
async fn serve_stats(ctx: &WorkerContext, stream: &mut TcpStream, head_only: bool) -> u64 {
    let caches: Vec<_> = ctx.all_caches.iter().map(|cache| cache.stats()).collect();
    let report = StatsReport::build(ctx.stats.snapshot(), &caches);
    let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
    let head = ResponseHead::new(200, "application/json", body.len() as u64);
    write_response(stream, &head, body.as_bytes(), head_only).await
}

/// Writes an error-page response. Returns the entity bytes written.
async fn write_error(stream: &mut TcpStream, status: u16, head_only: bool) -> u64 {
    let body = error_page(status);
    let head = ResponseHead::new(status, "text/html; charset=utf-8", body.len() as u64);
    let written = write_response(stream, &head, body.as_bytes(), head_only).await;
    trace!(status, reason = reason_phrase(status), "error response");
    written
}

/// Writes head and (unless suppressed) body. Returns the entity bytes
/// actually written; a failed write counts zero.
async fn write_response(
    stream: &mut TcpStream,
    head: &ResponseHead,
    body: &[u8],
    head_only: bool,
) -> u64 {
    if stream.write_all(head.serialize().as_bytes()).await.is_err() {
        return 0;
    }
    if head_only {
        return 0;
    }
    if stream.write_all(body).await.is_err() {
        return 0;
    }
    body.len() as u64
}
