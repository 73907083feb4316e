use serde::de::DeserializeOwned;
use tokio::io::{self, AsyncRead, AsyncReadExt};

use crate::{LEN_TYPE_SIZE, LenType, RecvError};

/// The receiving end handle of the communication.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    /// Creates a new `FrameReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    /// * `max_len` - The largest payload accepted.
    pub(super) fn new(rx: R, max_len: usize) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            max_len,
        }
    }

    /// Waits to receive a new message and parses it as JSON.
    ///
    /// # Returns
    /// The deserialized `T` or the reason the frame could not be read.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, RecvError> {
        let frame = self.recv_frame().await?;
        serde_json::from_slice(frame).map_err(RecvError::Malformed)
    }

    /// Waits to receive the raw payload of the next frame.
    ///
    /// An oversized frame is drained from the stream before `RecvError::TooLarge`
    /// is returned, so the next call starts on a frame boundary.
    ///
    /// # Returns
    /// A view of the payload, valid until the next receive.
    pub async fn recv_frame(&mut self) -> Result<&[u8], RecvError> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        let filled = self.fill(&mut size_buf).await?;

        if filled == 0 {
            return Err(RecvError::Closed);
        }

        if filled < LEN_TYPE_SIZE {
            return Err(RecvError::Truncated {
                expected: LEN_TYPE_SIZE,
                got: filled,
            });
        }

        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > self.max_len {
            let mut rest = (&mut self.rx).take(len as u64);
            let skipped = io::copy(&mut rest, &mut io::sink()).await? as usize;

            if skipped < len {
                return Err(RecvError::Truncated {
                    expected: len,
                    got: skipped,
                });
            }

            return Err(RecvError::TooLarge {
                len,
                max: self.max_len,
            });
        }

        let mut buf = std::mem::take(&mut self.buf);
        buf.resize(len, 0);

        let got = self.fill(&mut buf).await;
        self.buf = buf;

        let got = got?;
        if got < len {
            return Err(RecvError::Truncated { expected: len, got });
        }

        Ok(&self.buf)
    }

    /// Reads until `dst` is full or the stream ends.
    ///
    /// # Returns
    /// The amount of bytes written into `dst`.
    async fn fill(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;

        while filled < dst.len() {
            match self.rx.read(&mut dst[filled..]).await? {
                0 => break,
                n => filled += n,
            }
        }

        Ok(filled)
    }
}
