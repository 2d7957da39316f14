//! Message-level reader and writer over a byte stream.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{DapCodec, FramingError};
use super::protocol::Message;

/// Reads one complete message at a time.
pub struct MessageReader<R> {
    inner: FramedRead<R, DapCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_codec(reader, DapCodec::new())
    }

    pub fn with_codec(reader: R, codec: DapCodec) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    pub async fn read_message(&mut self) -> Result<Option<Message>, FramingError> {
        self.inner.next().await.transpose()
    }
}

/// Writes one message at a time, flushing after each.
///
/// Not synchronized: concurrent senders must go through the broker.
pub struct MessageWriter<W> {
    inner: FramedWrite<W, DapCodec>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, DapCodec::new()),
        }
    }

    pub async fn write_message(&mut self, message: Message) -> Result<(), FramingError> {
        self.inner.send(message).await
    }

    /// Flush and shut the underlying stream down.
    pub async fn close(&mut self) -> Result<(), FramingError> {
        self.inner.close().await
    }
}
