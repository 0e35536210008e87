//! The post-handshake byte stream (spec §4.4.5): transparently applies
//! the negotiated cipher to a `TcpStream`, so the rest of the crate (the
//! peer wire codec, in particular) can treat it as an ordinary
//! `AsyncRead + AsyncWrite`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use rc4::StreamCipher;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::mse::Rc4Sha1;

/// The cipher negotiated for a peer connection (spec §4.4.4's negotiated
/// cipher set).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cipher {
    PlainText,
    Rc4,
}

impl Cipher {
    pub fn id(self) -> u8 {
        match self {
            Self::PlainText => 0x01,
            Self::Rc4 => 0x02,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::PlainText),
            0x02 => Some(Self::Rc4),
            _ => None,
        }
    }
}

/// A `TcpStream` with an optional pair of RC4 keystreams layered over it.
///
/// Reads are decrypted in place as bytes arrive. Writes are encrypted
/// eagerly into an internal buffer (so each byte of keystream is consumed
/// exactly once, regardless of how the underlying socket chooses to drain
/// it) and flushed out on `poll_flush`/`poll_shutdown`.
pub struct CipherStream {
    inner: TcpStream,
    decrypt: Option<Rc4Sha1>,
    encrypt: Option<Rc4Sha1>,
    write_buf: BytesMut,
}

impl CipherStream {
    /// Wraps `inner` with no encryption: reads and writes pass through
    /// unchanged (the plaintext path of spec §4.4.2/§4.4.3).
    pub fn plain(inner: TcpStream) -> Self {
        Self {
            inner,
            decrypt: None,
            encrypt: None,
            write_buf: BytesMut::new(),
        }
    }

    /// Wraps `inner` with the given directional RC4 keystreams (spec
    /// §4.4.4).
    pub fn encrypted(inner: TcpStream, decrypt: Rc4Sha1, encrypt: Rc4Sha1) -> Self {
        Self {
            inner,
            decrypt: Some(decrypt),
            encrypt: Some(encrypt),
            write_buf: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> TcpStream {
        self.inner
    }

    fn drain_write_buf(
        mut inner: Pin<&mut TcpStream>,
        cx: &mut Context<'_>,
        buf: &mut BytesMut,
    ) -> Poll<io::Result<()>> {
        while !buf.is_empty() {
            match inner.as_mut().poll_write(cx, buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write cipher stream buffer",
                    )))
                }
                Poll::Ready(Ok(n)) => buf.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for CipherStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if let Some(decrypt) = this.decrypt.as_mut() {
                    decrypt.apply_keystream(&mut buf[..n]);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

impl AsyncWrite for CipherStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let start = this.write_buf.len();
        this.write_buf.extend_from_slice(buf);
        if let Some(encrypt) = this.encrypt.as_mut() {
            encrypt.apply_keystream(&mut this.write_buf[start..]);
        }
        // Opportunistically drain what we can without blocking the caller;
        // any remainder stays buffered until the next poll_write/flush.
        let _ = Self::drain_write_buf(Pin::new(&mut this.inner), cx, &mut this.write_buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Self::drain_write_buf(Pin::new(&mut this.inner), cx, &mut this.write_buf) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Self::drain_write_buf(Pin::new(&mut this.inner), cx, &mut this.write_buf) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}
