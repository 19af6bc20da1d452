//! Per-request proxy session: rewrites the upgrade request, dials the
//! upstream, then relays both directions concurrently. The client leg is
//! framed (validated, modified, re-encoded); the upstream leg is a raw
//! byte splice that also carries the upgrade response.

use crate::connection::Connection;
use crate::error::ProxyError;
use crate::frame::Opcode;
use crate::modifier::Modifier;
use crate::request::RequestHead;
use crate::router::RouteTarget;
use crate::server;
use crate::upstream;
use log::{debug, warn};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, mpsc};

/// Buffer for the raw upstream→client copy.
const RAW_COPY_BUF: usize = 300;

/// Host to present upstream: override wins, then the client's Origin,
/// then the original Host.
pub fn rewrite_host(req: &RequestHead, host_override: &str) -> String {
    if !host_override.is_empty() {
        return host_override.to_string();
    }
    match req.header("origin") {
        Some(origin) if !origin.is_empty() => origin.to_string(),
        _ => req.host.clone(),
    }
}

/// Runs one proxied session to completion. `leftover` holds bytes the
/// front end read past the request head; they are replayed ahead of the
/// socket reader.
pub async fn proxy<S>(
    mut downstream: S,
    leftover: Vec<u8>,
    req: RequestHead,
    target: Arc<RouteTarget>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if !req.is_websocket_upgrade() {
        let _ = server::write_response(
            &mut downstream,
            "400 Bad Request",
            "Must be a websocket request",
        )
        .await;
        return Ok(());
    }

    let mut upstream_req = req.clone();
    upstream_req.host = rewrite_host(&req, &target.host_override);
    for (key, value) in &target.headers {
        upstream_req.set_header(key, value);
    }

    let (down_rd, down_wr) = tokio::io::split(downstream);
    let mut client = Connection::new(Cursor::new(leftover).chain(down_rd), down_wr);

    let upstream_stream = match upstream::connect(&target.addr).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = client.write_raw(err.to_string().as_bytes()).await;
            return Err(err);
        }
    };
    let (up_rd, up_wr) = tokio::io::split(upstream_stream);
    let mut origin = Connection::send_only(up_wr);

    if let Err(err) = origin.write_raw(&upstream_req.to_bytes()).await {
        let _ = client.write_raw(err.to_string().as_bytes()).await;
        return Err(err);
    }
    debug!("forwarded upgrade for {} to {}", req.uri, target.addr);

    let text_modifiers: Vec<&Modifier> = target
        .modifiers
        .iter()
        .filter(|m| m.on == Opcode::Text)
        .collect();

    // First posted outcome wins. A clean client Close only retires the
    // framed direction; the raw copy keeps draining upstream bytes (the
    // server's own Close handshake included) until it posts.
    let (tx, mut rx) = mpsc::channel::<Result<(), ProxyError>>(2);
    let raw_relay = tokio::spawn(relay_raw(up_rd, client.writer_handle(), tx));

    let outcome = {
        let framed = relay_frames(&mut client, &mut origin, &text_modifiers);
        tokio::pin!(framed);
        let mut framed_done = false;
        loop {
            tokio::select! {
                res = &mut framed, if !framed_done => match res {
                    Ok(()) => framed_done = true,
                    Err(err) => break Err(err),
                },
                val = rx.recv() => break val.unwrap_or(Ok(())),
            }
        }
    };

    raw_relay.abort();
    if let Err(err) = &outcome {
        warn!("session for {} ended: {err}", req.uri);
        let _ = client.write_raw(err.to_string().as_bytes()).await;
    }
    // Best-effort Close with the recorded status; the peer may be gone.
    let _ = client.close().await;

    outcome
}

/// Client→upstream direction: one frame at a time, strictly in order.
async fn relay_frames<R, W, U>(
    client: &mut Connection<R, W>,
    origin: &mut Connection<tokio::io::Empty, U>,
    modifiers: &[&Modifier],
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    U: AsyncWrite + Unpin,
{
    loop {
        let frame = client.recv_frame().await?;
        let frame = match frame.opcode {
            Opcode::Close => return Ok(()),
            Opcode::Ping => frame.into_pong(),
            Opcode::Text => {
                let mut frame = frame;
                for modifier in modifiers {
                    frame = modifier.apply(frame)?;
                }
                frame
            }
            _ => frame,
        };
        origin.send_frame(&frame).await?;
    }
}

/// Upstream→client direction: a verbatim byte copy. Carries the upgrade
/// response and every server-originated frame, unparsed.
async fn relay_raw<R, W>(
    mut upstream: R,
    downstream: Arc<Mutex<BufWriter<W>>>,
    outcome: mpsc::Sender<Result<(), ProxyError>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RAW_COPY_BUF];
    loop {
        match upstream.read(&mut buf).await {
            Ok(0) => {
                let _ = outcome.send(Ok(())).await;
                return;
            }
            Ok(n) => {
                let mut writer = downstream.lock().await;
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    let _ = outcome.send(Err(err.into())).await;
                    return;
                }
                if let Err(err) = writer.flush().await {
                    let _ = outcome.send(Err(err.into())).await;
                    return;
                }
            }
            Err(err) => {
                let _ = outcome.send(Err(err.into())).await;
                return;
            }
        }
    }
}
