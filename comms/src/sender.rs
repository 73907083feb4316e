//! The implementation of the sending end of the application layer protocol.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, SendError};

/// The sending end handle of the communication.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
    max_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    /// Creates a new `FrameSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    /// * `max_len` - The largest payload this end is allowed to emit.
    pub(super) fn new(tx: W, max_len: usize) -> Self {
        Self {
            tx,
            buf: Vec::new(),
            max_len,
        }
    }

    /// Serializes `msg` as JSON and sends it through the inner writer.
    ///
    /// Nothing is written when the encoded message exceeds the maximum length.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    pub async fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<(), SendError> {
        let Self { tx, buf, max_len } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        serde_json::to_writer(&mut *buf, msg).map_err(SendError::Serialize)?;

        let len = buf.len() - LEN_TYPE_SIZE;
        if len > *max_len || len > LenType::MAX as usize {
            return Err(SendError::TooLarge { len, max: *max_len });
        }

        let header = (len as LenType).to_be_bytes();
        buf[..header.len()].copy_from_slice(&header);

        tx.write_all(buf).await?;
        tx.flush().await?;
        Ok(())
    }

    /// Shuts down the write half, signalling end of stream to the peer.
    pub async fn shutdown(&mut self) -> Result<(), SendError> {
        self.tx.shutdown().await?;
        Ok(())
    }
}
