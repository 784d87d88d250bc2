use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use wiretap_net::{
    BodyDecoder, HeadParser, Limits, ParseError, ParseErrorKind, ParseHead, ParseStatus,
    RequestHead, ResponseHead,
};
use wiretap_storage::BodyCapture;

use crate::error::ProxyError;

const READ_CHUNK: usize = 8192;

/// A stream with an owned read buffer. Bytes read past a message head stay
/// here and are served first by both the body relay and `AsyncRead`, so the
/// stream can be handed to a TLS session or a raw copy without losing data.
#[derive(Debug)]
pub struct BufferedStream<S> {
    inner: S,
    buffer: Vec<u8>,
    limits: Limits,
}

impl<S> BufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_limits(inner, Limits::default())
    }

    pub fn with_limits(inner: S, limits: Limits) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }
}

impl<S> BufferedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `Ok(None)` means the peer closed cleanly before sending anything.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ProxyError> {
        self.read_head().await
    }

    pub async fn read_response_head(&mut self) -> Result<Option<ResponseHead>, ProxyError> {
        self.read_head().await
    }

    async fn read_head<H: ParseHead>(&mut self) -> Result<Option<H>, ProxyError> {
        let mut parser = HeadParser::<H>::with_limits(self.limits);
        let pending = std::mem::take(&mut self.buffer);
        let mut status = parser.push(&pending);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            match status {
                ParseStatus::Complete { message, .. } => {
                    self.buffer = parser.take_remaining();
                    return Ok(Some(message));
                }
                ParseStatus::Error { error, .. } => return Err(ProxyError::Protocol(error)),
                ParseStatus::NeedMore { .. } => {}
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if parser.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Protocol(ParseError {
                    kind: ParseErrorKind::UnexpectedEof,
                    offset: parser.take_remaining().len(),
                }));
            }
            status = parser.push(&chunk[..n]);
        }
    }

    /// Copies one message body to `dst` exactly as framed on the wire while
    /// feeding the de-framed payload to `capture`.
    pub async fn relay_body<W>(
        &mut self,
        decoder: &mut BodyDecoder,
        dst: &mut W,
        capture: &mut BodyCapture,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut payload = Vec::new();
        while !decoder.is_done() {
            if self.buffer.is_empty() && self.fill().await? == 0 {
                decoder.finish_eof()?;
                break;
            }
            payload.clear();
            let consumed = decoder.decode(&self.buffer, &mut payload)?;
            dst.write_all(&self.buffer[..consumed]).await?;
            capture.write(&payload);
            self.buffer.drain(..consumed);
        }
        dst.flush().await?;
        Ok(())
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Non-blocking check used before reusing an idle connection. A peer
    /// that closed, errored, or sent unsolicited bytes is not reusable.
    pub fn is_stale(&mut self) -> bool {
        if !self.buffer.is_empty() {
            return true;
        }
        let mut probe = [0u8; 1];
        match self.inner.read(&mut probe).now_or_never() {
            None => false,
            Some(Ok(0)) | Some(Err(_)) => true,
            Some(Ok(n)) => {
                self.buffer.extend_from_slice(&probe[..n]);
                true
            }
        }
    }

    pub async fn write_response(
        &mut self,
        status: u16,
        reason: &str,
        content_type: &str,
        body: &[u8],
        close: bool,
    ) -> Result<(), ProxyError> {
        let mut head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n",
            body.len()
        );
        if close {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");
        self.inner.write_all(head.as_bytes()).await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use wiretap_net::{BodyDecoder, BodyFraming, ParseErrorKind};
    use wiretap_storage::BodyCapture;

    use super::BufferedStream;
    use crate::error::ProxyError;

    #[tokio::test]
    async fn reads_pipelined_heads_and_bodies() {
        let (mut peer, local) = duplex(1024);
        peer.write_all(
            b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await
        .unwrap();
        drop(peer);

        let mut stream = BufferedStream::new(local);
        let first = stream.read_request_head().await.unwrap().unwrap();
        assert_eq!(first.line.target, "/a");

        let mut decoder = BodyDecoder::new(BodyFraming::for_request(&first).unwrap());
        let mut sink = Vec::new();
        let mut capture = BodyCapture::new(16);
        stream
            .relay_body(&mut decoder, &mut sink, &mut capture)
            .await
            .unwrap();
        assert_eq!(sink, b"abc");
        assert_eq!(capture.bytes(), b"abc");

        let second = stream.read_request_head().await.unwrap().unwrap();
        assert_eq!(second.line.target, "/b");
        assert!(stream.read_request_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn relays_chunked_body_verbatim() {
        let (mut peer, local) = duplex(1024);
        let wire = b"5\r\nhello\r\n0\r\n\r\n";
        peer.write_all(wire).await.unwrap();

        let mut stream = BufferedStream::new(local);
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut sink = Vec::new();
        let mut capture = BodyCapture::new(16);
        stream
            .relay_body(&mut decoder, &mut sink, &mut capture)
            .await
            .unwrap();

        assert_eq!(sink, wire);
        assert_eq!(capture.bytes(), b"hello");
    }

    #[tokio::test]
    async fn partial_head_then_eof_is_protocol_error() {
        let (mut peer, local) = duplex(64);
        peer.write_all(b"GET\n").await.unwrap();
        drop(peer);

        let mut stream = BufferedStream::new(local);
        let error = stream.read_request_head().await.unwrap_err();
        assert_matches!(
            error,
            ProxyError::Protocol(ref parse) if parse.kind == ParseErrorKind::UnexpectedEof
        );
    }

    #[tokio::test]
    async fn malformed_request_line_is_rejected() {
        let (mut peer, local) = duplex(64);
        peer.write_all(b"GET\r\n\r\n").await.unwrap();

        let mut stream = BufferedStream::new(local);
        let error = stream.read_request_head().await.unwrap_err();
        assert_matches!(
            error,
            ProxyError::Protocol(ref parse) if parse.kind == ParseErrorKind::InvalidStartLine
        );
    }

    #[tokio::test]
    async fn buffered_bytes_are_read_first() {
        let (mut peer, local) = duplex(64);
        peer.write_all(b"CONNECT a:443 HTTP/1.1\r\n\r\nhello").await.unwrap();

        let mut stream = BufferedStream::new(local);
        stream.read_request_head().await.unwrap().unwrap();
        peer.write_all(b" world").await.unwrap();
        drop(peer);

        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "hello world");
    }

    #[tokio::test]
    async fn open_idle_peer_is_not_stale() {
        let (peer, local) = duplex(64);
        let mut stream = BufferedStream::new(local);
        assert!(!stream.is_stale());
        drop(peer);
        assert!(stream.is_stale());
    }
}
