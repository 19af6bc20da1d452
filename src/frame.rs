//! WebSocket frame codec (RFC 6455): byte-level decoding, encoding and
//! frame validation. The proxy only ever decodes client-originated
//! frames, so the decoder enforces the masked-from-client rule.

use crate::error::ProxyError;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Control frames must carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Close codes defined by RFC 6455 that a peer may legitimately send.
/// Anything in [3000, 5000) is also accepted as application-reserved.
const KNOWN_CLOSE_CODES: [u16; 9] = [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(code: u8) -> Opcode {
        match code & 0x0F {
            0 => Opcode::Continuation,
            1 => Opcode::Text,
            2 => Opcode::Binary,
            8 => Opcode::Close,
            9 => Opcode::Ping,
            10 => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0,
            Opcode::Text => 1,
            Opcode::Binary => 2,
            Opcode::Close => 8,
            Opcode::Ping => 9,
            Opcode::Pong => 10,
            Opcode::Reserved(code) => code,
        }
    }

    /// Control opcodes have the high bit of the 4-bit opcode set.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Opcode::Reserved(_))
    }
}

/// One WebSocket frame with its payload already unmasked. Modifiers and
/// everything above the codec always see plaintext bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit was zero: this frame is part of a multi-frame message.
    pub is_fragment: bool,
    pub opcode: Opcode,
    /// RSV1..RSV3 packed into the low three bits, as received.
    pub reserved: u8,
    pub is_masked: bool,
    pub length: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(payload: impl Into<Vec<u8>>) -> Frame {
        let payload = payload.into();
        Frame {
            is_fragment: false,
            opcode: Opcode::Text,
            reserved: 0,
            is_masked: false,
            length: payload.len() as u64,
            payload,
        }
    }

    /// A Close frame carrying `code` as its 2-byte big-endian payload.
    pub fn close(code: u16) -> Frame {
        Frame {
            is_fragment: false,
            opcode: Opcode::Close,
            reserved: 0,
            is_masked: false,
            length: 2,
            payload: code.to_be_bytes().to_vec(),
        }
    }

    /// The same frame re-stamped as a Pong. The proxy answers client
    /// pings itself instead of relaying them.
    pub fn into_pong(mut self) -> Frame {
        self.opcode = Opcode::Pong;
        self
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.length = payload.len() as u64;
        self.payload = payload;
    }

    pub fn close_code(&self) -> Option<u16> {
        if self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Serializes the frame for the server-side leg: FIN from
    /// `!is_fragment`, RSV bits zero, mask bit zero, payload unmasked.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 10);
        let mut first = self.opcode.as_u8();
        if !self.is_fragment {
            first |= 0x80;
        }
        buf.put_u8(first);

        if self.length <= 125 {
            buf.put_u8(self.length as u8);
        } else if self.length < 1 << 16 {
            buf.put_u8(126);
            buf.put_u16(self.length as u16);
        } else {
            buf.put_u8(127);
            buf.put_u64(self.length);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Reads exactly one frame off `reader`. A stream that ends mid-frame
/// surfaces as `UnexpectedEof`. The mask key is only consumed when the
/// MASK bit is set; unmasked frames are left for [`validate`] to reject.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;

    let is_fragment = head[0] & 0x80 == 0;
    let opcode = Opcode::from_u8(head[0] & 0x0F);
    let reserved = (head[0] & 0x70) >> 4;
    let is_masked = head[1] & 0x80 != 0;

    let mut length = u64::from(head[1] & 0x7F);
    if length == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext).await?;
        length = u64::from(u16::from_be_bytes(ext));
    } else if length == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext).await?;
        length = u64::from_be_bytes(ext);
    }

    let mut mask = [0u8; 4];
    if is_masked {
        reader.read_exact(&mut mask).await?;
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    if is_masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(Frame {
        is_fragment,
        opcode,
        reserved,
        is_masked,
        length,
        payload,
    })
}

/// Enforces the RFC 6455 rules the proxy cares about on a frame received
/// from a client. The returned error carries the close status to record
/// on the connection (1002 for protocol violations, 1007 for bad data).
pub fn validate(frame: &Frame) -> Result<(), ProxyError> {
    if !frame.is_masked {
        return Err(ProxyError::Protocol("unmasked client frame".into()));
    }
    if frame.opcode.is_control() && (frame.length > MAX_CONTROL_PAYLOAD || frame.is_fragment) {
        return Err(ProxyError::Protocol(
            "control frames must not be fragmented and must carry at most 125 bytes".into(),
        ));
    }
    if frame.opcode.is_reserved() {
        return Err(ProxyError::Protocol(format!(
            "opcode {:#x} is reserved",
            frame.opcode.as_u8()
        )));
    }
    if frame.reserved != 0 {
        return Err(ProxyError::Protocol(format!(
            "RSV {:#x} is reserved",
            frame.reserved
        )));
    }
    if frame.opcode == Opcode::Text
        && !frame.is_fragment
        && std::str::from_utf8(&frame.payload).is_err()
    {
        return Err(ProxyError::Data("invalid UTF-8 text message".into()));
    }
    if frame.opcode == Opcode::Close {
        if frame.length >= 2 {
            let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
            if code >= 5000 || (code < 3000 && !KNOWN_CLOSE_CODES.contains(&code)) {
                return Err(ProxyError::Protocol(format!("invalid close code {code}")));
            }
            if frame.length > 2 && std::str::from_utf8(&frame.payload[2..]).is_err() {
                return Err(ProxyError::Data("invalid UTF-8 close reason".into()));
            }
        } else if frame.length != 0 {
            return Err(ProxyError::Protocol("malformed close payload".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_bytes(payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect()
    }

    /// Builds the wire form of a masked client frame.
    fn client_frame(fin: bool, opcode: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut first = opcode;
        if fin {
            first |= 0x80;
        }
        out.push(first);
        let len = payload.len();
        if len <= 125 {
            out.push(0x80 | len as u8);
        } else if len < 1 << 16 {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&key);
        out.extend_from_slice(&mask_bytes(payload, key));
        out
    }

    async fn decode(bytes: &[u8]) -> Frame {
        let mut reader = &bytes[..];
        read_frame(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn decodes_masked_text_frame() {
        let frame = decode(&client_frame(true, 1, b"hello", [0xA1, 0x02, 0x13, 0x44])).await;
        assert!(!frame.is_fragment);
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.is_masked);
        assert_eq!(frame.length, 5);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn unmasking_is_independent_of_the_key() {
        for key in [[0u8; 4], [0xFF; 4], [1, 2, 3, 4]] {
            let frame = decode(&client_frame(true, 2, b"\x00\x01\xFE\xFF", key)).await;
            assert_eq!(frame.payload, b"\x00\x01\xFE\xFF");
        }
    }

    #[tokio::test]
    async fn roundtrip_preserves_frame() {
        for payload_len in [0usize, 1, 125, 126, 65535, 65536, 1 << 20] {
            let original = Frame::text(vec![b'x'; payload_len]);
            let frame = decode(&original.encode()).await;
            assert_eq!(frame.opcode, original.opcode);
            assert_eq!(frame.length, payload_len as u64);
            assert_eq!(frame.payload, original.payload);
            assert!(!frame.is_fragment);
            assert!(!frame.is_masked);
        }
    }

    #[test]
    fn encode_picks_the_correct_length_form() {
        assert_eq!(Frame::text(vec![0u8; 125]).encode()[1], 125);
        assert_eq!(Frame::text(vec![0u8; 126]).encode()[1], 126);
        assert_eq!(Frame::text(vec![0u8; 65535]).encode()[1], 126);
        assert_eq!(Frame::text(vec![0u8; 65536]).encode()[1], 127);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let bytes = client_frame(true, 1, b"hello", [9, 9, 9, 9]);
        let mut reader = &bytes[..bytes.len() - 2];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn rejects_unmasked_client_frame() {
        let frame = decode(&Frame::text(b"hi".to_vec()).encode()).await;
        assert!(matches!(validate(&frame), Err(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn rejects_oversized_and_fragmented_control_frames() {
        let long = decode(&client_frame(true, 9, &[0u8; 126], [0; 4])).await;
        assert!(matches!(validate(&long), Err(ProxyError::Protocol(_))));

        let fragmented = decode(&client_frame(false, 8, b"", [0; 4])).await;
        assert!(matches!(validate(&fragmented), Err(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn rejects_reserved_opcodes_and_rsv_bits() {
        for opcode in [3u8, 7, 11, 15] {
            let frame = decode(&client_frame(true, opcode, b"", [0; 4])).await;
            assert!(matches!(validate(&frame), Err(ProxyError::Protocol(_))));
        }

        let mut bytes = client_frame(true, 1, b"ok", [0; 4]);
        bytes[0] |= 0x40; // RSV1
        let frame = decode(&bytes).await;
        assert_eq!(frame.reserved, 0b100);
        assert!(matches!(validate(&frame), Err(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn rejects_invalid_utf8_text() {
        let frame = decode(&client_frame(true, 1, b"\xFF\xFE", [5, 6, 7, 8])).await;
        assert!(matches!(validate(&frame), Err(ProxyError::Data(_))));
    }

    #[tokio::test]
    async fn fragmented_text_skips_utf8_check() {
        let frame = decode(&client_frame(false, 1, b"\xFF\xFE", [5, 6, 7, 8])).await;
        assert!(validate(&frame).is_ok());
    }

    #[tokio::test]
    async fn close_code_policy() {
        let close = |code: u16| client_frame(true, 8, &code.to_be_bytes(), [1, 1, 1, 1]);

        for code in KNOWN_CLOSE_CODES {
            let frame = decode(&close(code)).await;
            assert!(validate(&frame).is_ok(), "code {code} should be accepted");
        }
        for code in [3000u16, 4999] {
            let frame = decode(&close(code)).await;
            assert!(validate(&frame).is_ok(), "code {code} should be accepted");
        }
        for code in [5000u16, 2999, 1004, 1015] {
            let frame = decode(&close(code)).await;
            assert!(
                matches!(validate(&frame), Err(ProxyError::Protocol(_))),
                "code {code} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn close_with_one_byte_payload_is_malformed() {
        let frame = decode(&client_frame(true, 8, &[0x03], [0; 4])).await;
        assert!(matches!(validate(&frame), Err(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn close_reason_must_be_utf8() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let frame = decode(&client_frame(true, 8, &payload, [2, 4, 6, 8])).await;
        assert!(validate(&frame).is_ok());

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"\xFF");
        let frame = decode(&client_frame(true, 8, &payload, [2, 4, 6, 8])).await;
        assert!(matches!(validate(&frame), Err(ProxyError::Data(_))));
    }

    #[test]
    fn ping_becomes_pong() {
        let mut frame = Frame::text(Vec::new());
        frame.opcode = Opcode::Ping;
        let pong = frame.into_pong();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert!(!pong.is_fragment);
    }
}
