//! Buffered duplex wrapper over a byte stream with frame-level recv/send
//! and close-status tracking.

use crate::error::ProxyError;
use crate::frame::{self, Frame};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

/// One side of a proxied session. The writer sits behind a mutex because
/// the downstream socket has two writers: the raw upstream→client relay
/// and the session cleanup path (error text, Close frame). The framed
/// direction never writes downstream, so there is no contention in the
/// steady state.
pub struct Connection<R, W> {
    reader: BufReader<R>,
    writer: Arc<Mutex<BufWriter<W>>>,
    status: u16,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Connection {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            status: 1000,
        }
    }

    /// The close status recorded by the last failed `recv_frame`, or
    /// 1000 if every frame so far validated cleanly.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// A clonable handle to the write side, for the raw relay.
    pub fn writer_handle(&self) -> Arc<Mutex<BufWriter<W>>> {
        Arc::clone(&self.writer)
    }

    /// Decodes and validates the next frame. A validation failure
    /// records its close status on the connection before propagating.
    pub async fn recv_frame(&mut self) -> Result<Frame, ProxyError> {
        let frame = frame::read_frame(&mut self.reader).await?;
        if let Err(err) = frame::validate(&frame) {
            self.status = err.close_code();
            return Err(err);
        }
        Ok(frame)
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), ProxyError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Writes raw bytes and flushes. Used for the forwarded upgrade
    /// request and for error text on the way out.
    pub async fn write_raw(&self, data: &[u8]) -> Result<(), ProxyError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Sends a Close frame carrying the recorded status, then shuts the
    /// stream down. Invoked on the session cleanup path.
    pub async fn close(&mut self) -> Result<(), ProxyError> {
        let close = Frame::close(self.status);
        self.send_frame(&close).await?;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

impl<W> Connection<tokio::io::Empty, W>
where
    W: AsyncWrite + Unpin,
{
    /// A connection used only for sending, like the upstream leg whose
    /// read side belongs to the raw relay.
    pub fn send_only(writer: W) -> Self {
        Connection::new(tokio::io::empty(), writer)
    }
}
