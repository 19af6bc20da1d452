//! Upstream dialing: plain TCP for `ws`, TLS for `wss`. The TLS client
//! accepts any certificate, mirroring the insecure-by-design posture of
//! the proxied handshake.

use crate::error::ProxyError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub const WS_SCHEME: &str = "ws";
pub const WSS_SCHEME: &str = "wss";

#[derive(Debug)]
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Dials the upstream endpoint named by a `ws://host:port` or
/// `wss://host:port` URL.
pub async fn connect(addr: &str) -> Result<UpstreamStream, ProxyError> {
    let url = url::Url::parse(addr)?;
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::Handshake(format!("upstream address {addr} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyError::Handshake(format!("upstream address {addr} has no port")))?;

    match url.scheme() {
        WS_SCHEME => {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| ProxyError::Handshake(format!("dial {host}:{port}: {e}")))?;
            Ok(UpstreamStream::Plain(stream))
        }
        WSS_SCHEME => {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| ProxyError::Handshake(format!("dial {host}:{port}: {e}")))?;
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| ProxyError::Handshake(format!("invalid upstream host: {e}")))?;
            let connector = TlsConnector::from(insecure_tls_config());
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProxyError::Handshake(format!("TLS handshake with {host}:{port}: {e}")))?;
            Ok(UpstreamStream::Tls(Box::new(stream)))
        }
        other => Err(ProxyError::Handshake(format!(
            "unsupported upstream scheme {other}"
        ))),
    }
}

fn insecure_tls_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
        .with_no_client_auth();
    Arc::new(config)
}

/// Accepts any upstream certificate.
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_ws_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("ws://{}", listener.local_addr().unwrap());

        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connect(&addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn refused_dial_is_a_handshake_error() {
        // Port 1 on localhost is essentially never listening.
        let err = connect("ws://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let err = connect("http://127.0.0.1:80").await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }
}
