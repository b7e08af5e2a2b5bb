/// Newline-delimited JSON framing used on every link
use crate::errors::{RelayError, RelayResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest accepted frame, excluding the newline
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Serialize `message` as one line terminated by `\n`
pub fn encode_frame<T: Serialize>(message: &T) -> RelayResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> RelayResult<T> {
    Ok(serde_json::from_slice(frame)?)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Splits a byte stream into frames.
///
/// Partially received bytes are kept across calls, so `next_frame` can be
/// raced against a timeout without losing data.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_BYTES)
    }

    pub fn with_limit(inner: R, max_frame: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
            max_frame,
        }
    }

    /// Next non-blank frame without its line terminator; `None` on clean EOF
    pub async fn next_frame(&mut self) -> RelayResult<Option<Vec<u8>>> {
        loop {
            // payload plus an optional `\r` and the `\n`
            let budget = (self.max_frame + 2).saturating_sub(self.pending.len()) as u64;
            let read = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.pending)
                .await?;

            if self.pending.last() == Some(&b'\n') {
                let mut frame = std::mem::take(&mut self.pending);
                frame.pop();
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                if frame.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                if frame.len() > self.max_frame {
                    return Err(RelayError::FrameTooLarge {
                        max: self.max_frame,
                    });
                }
                return Ok(Some(frame));
            }

            if self.pending.len() > self.max_frame + 1 {
                self.pending.clear();
                return Err(RelayError::FrameTooLarge {
                    max: self.max_frame,
                });
            }

            if read == 0 {
                // EOF: flush an unterminated trailing frame
                let frame = std::mem::take(&mut self.pending);
                if frame.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                if frame.len() > self.max_frame {
                    return Err(RelayError::FrameTooLarge {
                        max: self.max_frame,
                    });
                }
                return Ok(Some(frame));
            }
        }
    }

    /// Read and decode the next frame as `T`
    pub async fn next_message<T: DeserializeOwned>(&mut self) -> RelayResult<Option<T>> {
        match self.next_frame().await? {
            Some(frame) => decode_frame(&frame).map(Some),
            None => Ok(None),
        }
    }
}
