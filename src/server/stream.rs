//! Live screen streaming: the MJPEG proxy (HTTP and WebSocket variants) and
//! the screenshot-poll WebSocket used for platforms without an MJPEG
//! upstream. Stream lifetime is tied to the downstream client; both ends are
//! released on disconnect.

use std::io::Cursor;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

use crate::driver::DynDriver;
use crate::error::DriverError;

/// Mirror chunk size for the HTTP proxy.
const PROXY_CHUNK_SIZE: usize = 8 * 1024;
/// Frame cadence for the screenshot-poll fallback.
const POLL_FRAME_INTERVAL: Duration = Duration::from_millis(150);

/// Logs when the downstream goes away; dropping it travels with the body
/// stream, so the upstream connection and client die with the response.
struct UpstreamGuard {
    serial: String,
}

impl Drop for UpstreamGuard {
    fn drop(&mut self) {
        log::info!("mjpeg proxy closed for {}", self.serial);
    }
}

async fn open_upstream(driver: &DynDriver) -> Result<reqwest::Response, DriverError> {
    if !driver.start_mjpeg_stream().await? {
        return Err(DriverError::StreamUpstreamClosed(
            "failed to start mjpeg stream".to_string(),
        ));
    }
    let url = driver.mjpeg_url().await.ok_or_else(|| {
        DriverError::StreamUpstreamClosed("mjpeg url not available".to_string())
    })?;

    // No client-side timeout: the stream is open-ended.
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| DriverError::Other(e.into()))?;
    let upstream = client
        .get(&url)
        .send()
        .await
        .map_err(|e| DriverError::StreamUpstreamClosed(format!("upstream connect failed: {}", e)))?;
    if !upstream.status().is_success() {
        return Err(DriverError::StreamUpstreamClosed(format!(
            "upstream returned {}",
            upstream.status()
        )));
    }
    Ok(upstream)
}

/// HTTP proxy: forward the upstream multipart response to the client in
/// 8 KiB chunks with caching disabled.
pub async fn mjpeg_proxy_response(driver: DynDriver) -> Result<Response, DriverError> {
    let upstream = open_upstream(&driver).await?;

    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok())
        .unwrap_or_else(|| HeaderValue::from_static("multipart/x-mixed-replace"));

    let guard = UpstreamGuard {
        serial: driver.serial().to_string(),
    };
    let body = Body::from_stream(rechunk(upstream, guard));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(body)
        .map_err(|e| DriverError::Other(e.into()))?;
    response
        .headers_mut()
        .remove(header::CONTENT_LENGTH);
    Ok(response)
}

/// Re-chunk the upstream body into bounded pieces. The guard rides along so
/// it drops exactly when the downstream stops pulling.
fn rechunk(
    upstream: reqwest::Response,
    guard: UpstreamGuard,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> {
    struct State {
        inner: reqwest::Response,
        buffer: BytesMut,
        done: bool,
        _guard: UpstreamGuard,
    }

    futures_util::stream::unfold(
        State {
            inner: upstream,
            buffer: BytesMut::new(),
            done: false,
            _guard: guard,
        },
        |mut state| async move {
            loop {
                if state.buffer.len() >= PROXY_CHUNK_SIZE {
                    let chunk = state.buffer.split_to(PROXY_CHUNK_SIZE).freeze();
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let chunk = state.buffer.split().freeze();
                    return Some((Ok(chunk), state));
                }
                match state.inner.chunk().await {
                    Ok(Some(bytes)) => state.buffer.extend_from_slice(&bytes),
                    Ok(None) => state.done = true,
                    Err(e) => {
                        return Some((
                            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)),
                            state,
                        ))
                    }
                }
            }
        },
    )
}

/// WebSocket variant: split the multipart body on its boundary and send one
/// binary message per JPEG part.
pub async fn mjpeg_ws(mut socket: WebSocket, driver: DynDriver) {
    let upstream = match open_upstream(&driver).await {
        Ok(u) => u,
        Err(e) => {
            log::error!("mjpeg ws upstream failed for {}: {}", driver.serial(), e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let boundary = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_boundary)
        .unwrap_or_else(|| "--BoundaryString".to_string());
    let marker = if boundary.starts_with("--") {
        boundary
    } else {
        format!("--{}", boundary)
    };

    let mut body = upstream.bytes_stream();
    let mut buffer = BytesMut::new();

    loop {
        tokio::select! {
            chunk = body.next() => {
                match chunk {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        log::info!("mjpeg upstream dropped for {}: {}", driver.serial(), e);
                        break;
                    }
                    None => break,
                }
                while let Some(frame) = split_frame(&mut buffer, marker.as_bytes()) {
                    if !frame.is_empty() && socket.send(Message::Binary(frame)).await.is_err() {
                        // Client went away; tear down the upstream with us.
                        return;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

fn parse_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    })
}

/// Pop one complete part (payload only, headers stripped) out of the buffer.
fn split_frame(buffer: &mut BytesMut, marker: &[u8]) -> Option<Vec<u8>> {
    let start = find(buffer, marker)?;
    let after_marker = start + marker.len();
    let end = find(&buffer[after_marker..], marker)? + after_marker;

    let part = buffer[after_marker..end].to_vec();
    let _ = buffer.split_to(end);

    // Drop the part headers (terminated by a blank line).
    let payload = match find(&part, b"\r\n\r\n") {
        Some(idx) => part[idx + 4..].to_vec(),
        None => part,
    };
    Some(trim_crlf(payload))
}

fn trim_crlf(mut payload: Vec<u8>) -> Vec<u8> {
    while payload.ends_with(b"\r\n") {
        payload.truncate(payload.len() - 2);
    }
    while payload.starts_with(b"\r\n") {
        payload.drain(..2);
    }
    payload
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Screenshot-poll streamer for platforms without an MJPEG upstream: each
/// frame is the current screen re-encoded as JPEG and sent as one binary
/// message.
pub async fn screenshot_poll_ws(socket: WebSocket, driver: DynDriver) {
    use futures_util::SinkExt;

    log::info!("screenshot poll stream started for {}", driver.serial());
    let (mut sink, mut stream) = socket.split();
    loop {
        let frame = match driver.screenshot().await {
            Ok(img) => {
                let mut jpeg = Vec::new();
                let encode = img.write_to(
                    &mut Cursor::new(&mut jpeg),
                    image::ImageOutputFormat::Jpeg(70),
                );
                match encode {
                    Ok(()) => jpeg,
                    Err(e) => {
                        log::error!("frame encode failed for {}: {}", driver.serial(), e);
                        break;
                    }
                }
            }
            Err(e) => {
                log::error!("frame capture failed for {}: {}", driver.serial(), e);
                break;
            }
        };

        tokio::select! {
            sent = sink.send(Message::Binary(frame)) => {
                if sent.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
        tokio::time::sleep(POLL_FRAME_INTERVAL).await;
    }
    let _ = sink.send(Message::Close(None)).await;
    log::info!("screenshot poll stream closed for {}", driver.serial());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boundary() {
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace;boundary=\"--b\"").as_deref(),
            Some("--b")
        );
        assert_eq!(parse_boundary("image/jpeg"), None);
    }

    #[test]
    fn test_split_frame_strips_headers() {
        let mut buffer = BytesMut::from(
            &b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n\xff\xd8\xff\xd9\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\nrest"[..],
        );
        let frame = split_frame(&mut buffer, b"--frame").unwrap();
        assert_eq!(frame, b"\xff\xd8\xff\xd9".to_vec());
        // The second part is incomplete (no trailing boundary yet).
        assert!(split_frame(&mut buffer, b"--frame").is_none());
    }

    #[test]
    fn test_split_frame_waits_for_full_part() {
        let mut buffer = BytesMut::from(&b"--frame\r\n\r\npartial"[..]);
        assert!(split_frame(&mut buffer, b"--frame").is_none());
        buffer.extend_from_slice(b"-more\r\n--frame");
        let frame = split_frame(&mut buffer, b"--frame").unwrap();
        assert_eq!(frame, b"partial-more".to_vec());
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"hello world", b"world"), Some(6));
        assert_eq!(find(b"hello", b"x"), None);
        assert_eq!(find(b"ab", b"abc"), None);
    }
}
