//! HTTP/1.1 front end: accepts connections, reads just enough HTTP to
//! route the upgrade request, then hands the socket to a proxy session.
//! Reading the head ourselves is what makes the hijack trivial: once it
//! is consumed the session owns the raw stream.

use crate::error::ProxyError;
use crate::request::RequestHead;
use crate::router::Router;
use crate::ws_proxy;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Upper bound on the upgrade request head.
const MAX_HEADER_SIZE: usize = 8192;

/// Accept loop for one listener. Runs until the shutdown token fires;
/// each accepted connection gets its own task and its failures never
/// reach this loop.
pub async fn run(listener: TcpListener, router: Arc<Router>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Ok(addr) = listener.local_addr() {
                    info!("listener on {addr} shutting down");
                }
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let router = Arc::clone(&router);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, peer, router).await {
                            warn!("{peer}: {err}");
                        }
                    });
                }
                Err(err) => error!("accept failed: {err}"),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
) -> Result<(), ProxyError> {
    let (head, leftover) = read_request_head(&mut stream).await?;
    let req = match RequestHead::parse(&head) {
        Ok(req) => req,
        Err(err) => {
            let _ = write_response(&mut stream, "400 Bad Request", &err.to_string()).await;
            return Err(err);
        }
    };

    let Some(target) = router.find(&req.uri) else {
        debug!("{peer}: no upstream for {}", req.uri);
        let _ = write_response(&mut stream, "400 Bad Request", &ProxyError::Route.to_string())
            .await;
        return Ok(());
    };

    info!("new request from {peer}: host={} uri={}", req.host, req.uri);
    ws_proxy::proxy(stream, leftover, req, target).await
}

/// Reads until the end of the request head. Returns the head bytes
/// (including the terminating blank line) and whatever was read past it.
async fn read_request_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Handshake(
                "connection closed before request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            let leftover = buf.split_off(pos);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(ProxyError::Handshake("request head too large".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Minimal HTTP/1.1 response used for pre-upgrade rejections.
pub(crate) async fn write_response<W>(
    writer: &mut W,
    status: &str,
    body: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_head_from_leftover() {
        let mut input: &[u8] = b"GET /ws HTTP/1.1\r\nHost: a\r\n\r\n\x81\x80abcd";
        let (head, leftover) = read_request_head(&mut input).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(leftover, b"\x81\x80abcd");
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let mut input: &[u8] = b"GET /ws HTTP/1.1\r\nHost";
        let err = read_request_head(&mut input).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut big = b"GET /ws HTTP/1.1\r\n".to_vec();
        big.extend(std::iter::repeat_n(b'a', MAX_HEADER_SIZE + 1));
        let mut input: &[u8] = &big;
        let err = read_request_head(&mut input).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn response_carries_status_and_body() {
        let mut out = Vec::new();
        write_response(&mut out, "400 Bad Request", "upstream not found")
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Content-Length: 18\r\n"));
        assert!(text.ends_with("\r\n\r\nupstream not found"));
    }
}
