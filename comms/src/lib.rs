mod error;
pub mod msg;
mod receiver;
mod sender;
pub mod tensor;

use tokio::io::{AsyncRead, AsyncWrite};

pub use error::{RecvError, SendError};
pub use receiver::FrameReceiver;
pub use sender::FrameSender;

type LenType = u32;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The default upper bound for a single frame's payload, 64 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Creates both `FrameReceiver` and `FrameSender` network channel parts.
///
/// Given a reader and writer creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
/// * `max_len` - The largest payload, in bytes, either end will accept.
///
/// # Returns
/// A communication stream in the form of a frame receiver and sender.
pub fn channel<R, W>(rx: R, tx: W, max_len: usize) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx, max_len), FrameSender::new(tx, max_len))
}
