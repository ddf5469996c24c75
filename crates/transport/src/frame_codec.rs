//! Length-delimited framing over any TLS byte stream

use crate::TransportError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::trace;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frames carried over a byte stream with a u32 length prefix.
///
/// Reads and writes are independent; both end with `StreamClosed` as soon
/// as the stream is closed locally or the peer goes away.
pub(crate) struct FramedStream {
    reader: Mutex<FramedRead<BoxedReader, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
    closed: CancellationToken,
    max_frame_size: usize,
}

impl FramedStream {
    pub(crate) fn new<R, W>(reader: R, writer: W, max_frame_size: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec()
        };

        Self {
            reader: Mutex::new(FramedRead::new(Box::new(reader) as BoxedReader, codec())),
            writer: Mutex::new(FramedWrite::new(Box::new(writer) as BoxedWriter, codec())),
            closed: CancellationToken::new(),
            max_frame_size,
        }
    }

    pub(crate) async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        let mut writer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::StreamClosed),
            writer = self.writer.lock() => writer,
        };

        let len = frame.len();
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::StreamClosed),
            result = writer.send(frame) => result.map_err(|e| self.fail(e, None)),
        };
        trace!("sent frame of {} bytes", len);
        result
    }

    pub(crate) async fn receive(&self) -> Result<Bytes, TransportError> {
        let mut reader = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::StreamClosed),
            reader = self.reader.lock() => reader,
        };

        let failed = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::StreamClosed),
            item = reader.next() => match item {
                Some(Ok(frame)) => return Ok(frame.freeze()),
                Some(Err(e)) => {
                    let declared = declared_length(reader.read_buffer());
                    self.fail(e, declared)
                }
                None => {
                    self.closed.cancel();
                    return Err(TransportError::StreamClosed);
                }
            },
        };

        // framing is lost; nothing after this point can be trusted
        drop(reader);
        self.close().await;
        Err(failed)
    }

    /// Flush and shut the write side down, then fail every pending call
    pub(crate) async fn close(&self) {
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        let _ = SinkExt::<Bytes>::close(&mut *writer).await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Mark the stream dead and map `e`. `declared` is the length prefix
    /// still sitting in the read buffer when the codec refused a frame.
    fn fail(&self, e: std::io::Error, declared: Option<usize>) -> TransportError {
        self.closed.cancel();
        match e.kind() {
            std::io::ErrorKind::InvalidData => match declared {
                Some(size) if size > self.max_frame_size => TransportError::MessageTooLarge {
                    size,
                    max: self.max_frame_size,
                },
                _ => TransportError::Io(e),
            },
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => TransportError::StreamClosed,
            _ => TransportError::Io(e),
        }
    }
}

/// Length prefix at the head of `buffer`, if a whole one is there
fn declared_length(buffer: &[u8]) -> Option<usize> {
    let head: [u8; 4] = buffer.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(head) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(max: usize) -> (FramedStream, FramedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            FramedStream::new(a_read, a_write, max),
            FramedStream::new(b_read, b_write, max),
        )
    }

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (left, right) = pair(1024);

        left.send(Bytes::from_static(b"one")).await.unwrap();
        left.send(Bytes::from_static(b"")).await.unwrap();
        left.send(Bytes::from_static(b"three")).await.unwrap();

        assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(right.receive().await.unwrap(), Bytes::new());
        assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"three"));
    }

    #[tokio::test]
    async fn test_oversized_send_rejected_locally() {
        let (left, _right) = pair(8);

        let result = left.send(Bytes::from(vec![0u8; 9])).await;
        assert!(matches!(result, Err(TransportError::MessageTooLarge { size: 9, max: 8 })));
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_closes_stream() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let bounded = FramedStream::new(peer_read, peer_write, 8);

        // a 64 byte frame announced to a reader that takes at most 8
        raw.write_all(&64u32.to_be_bytes()).await.unwrap();
        raw.write_all(&[0u8; 64]).await.unwrap();

        assert!(matches!(
            bounded.receive().await,
            Err(TransportError::MessageTooLarge { size: 64, max: 8 })
        ));
        assert!(bounded.is_closed());
        assert!(matches!(bounded.receive().await, Err(TransportError::StreamClosed)));
        assert!(matches!(
            bounded.send(Bytes::from_static(b"late")).await,
            Err(TransportError::StreamClosed)
        ));

        // the peer sees the write side shut
        let mut rest = Vec::new();
        raw.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_declared_length_needs_a_whole_prefix() {
        assert_eq!(declared_length(&[0, 0, 1, 0, 0xff]), Some(256));
        assert_eq!(declared_length(&[0, 0, 1]), None);
    }

    #[tokio::test]
    async fn test_peer_close_ends_receive() {
        let (left, right) = pair(1024);

        left.close().await;
        assert!(matches!(right.receive().await, Err(TransportError::StreamClosed)));
        assert!(right.is_closed());
    }

    #[tokio::test]
    async fn test_local_close_cancels_pending_receive() {
        let (left, _right) = pair(1024);
        let left = std::sync::Arc::new(left);

        let pending = tokio::spawn({
            let left = left.clone();
            async move { left.receive().await }
        });
        tokio::task::yield_now().await;
        left.close().await;

        assert!(matches!(pending.await.unwrap(), Err(TransportError::StreamClosed)));
        assert!(matches!(
            left.send(Bytes::from_static(b"late")).await,
            Err(TransportError::StreamClosed)
        ));
    }
}
