//! Frame transport: TLS (or plain TCP) socket with length-prefixed framing.
//!
//! Frames are a 4-byte big-endian length followed by that many bytes of
//! envelope.  The length cap (`max_frame_bytes`) is enforced in both
//! directions by the codec: an oversized inbound frame is a decode error
//! that tears the connection down, and an oversized outbound frame is
//! refused before it reaches the wire.

use crate::config::SessionConfig;
use crate::error::SessionError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

pub type FrameReader = FramedRead<ReadHalf<MaybeTls>, LengthDelimitedCodec>;
pub type FrameWriter = FramedWrite<WriteHalf<MaybeTls>, LengthDelimitedCodec>;

/// A client stream that is either raw TCP (tests, private deployments) or
/// TLS over TCP (production gateways).
pub enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a connection to the configured gateway and return framed halves.
///
/// The reader half is owned by the read loop, the writer half by the send
/// scheduler; both are torn down by cancelling their connection token.
pub async fn connect(cfg: &SessionConfig) -> Result<(FrameReader, FrameWriter), SessionError> {
    let stream = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
    stream.set_nodelay(true)?;

    let io = if cfg.tls {
        let connector = tls_connector();
        let server_name = ServerName::try_from(cfg.host.clone())
            .map_err(|_| SessionError::Config(format!("invalid TLS server name: {}", cfg.host)))?;
        let tls = connector.connect(server_name, stream).await?;
        MaybeTls::Tls(Box::new(tls))
    } else {
        MaybeTls::Plain(stream)
    };
    debug!(host = %cfg.host, port = cfg.port, tls = cfg.tls, "transport connected");

    let (read_half, write_half) = tokio::io::split(io);
    Ok((
        FramedRead::new(read_half, frame_codec(cfg.max_frame_bytes)),
        FramedWrite::new(write_half, frame_codec(cfg.max_frame_bytes)),
    ))
}

/// The shared framing codec: 4-byte big-endian length prefix, bounded frames.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(tl_protocol::LENGTH_PREFIX_BYTES)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
