//! Newline-delimited JSON framing over the child's stdio.
//!
//! One JSON object per LF-terminated UTF-8 line. Readers tolerate a
//! trailing CR; writers emit canonical `serde_json` output followed by
//! a single LF in one contiguous write. A line longer than the
//! configured cap is a `FrameTooLarge` error and the supervisor
//! restarts the child; any other decode failure (non-UTF-8 bytes,
//! malformed JSON) marks the child degraded.

use crate::error::{BridgeError, Result};
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Default cap on a single stdio frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads LF-delimited JSON records from a byte stream.
pub struct FrameReader<R> {
    limit: usize,
    inner: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R, max_frame_bytes: usize) -> Self {
        Self {
            limit: max_frame_bytes,
            inner: FramedRead::new(stream, LinesCodec::new_with_max_length(max_frame_bytes)),
        }
    }

    /// Read the next complete record. `None` means EOF.
    ///
    /// Partial lines are buffered across reads by the underlying
    /// codec; empty lines are skipped.
    pub async fn read_one(&mut self) -> Option<Result<Value>> {
        loop {
            match self.inner.next().await? {
                Ok(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    return Some(
                        serde_json::from_str::<Value>(&line)
                            .map_err(|e| BridgeError::FrameDecode(e.to_string())),
                    );
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Some(Err(BridgeError::FrameTooLarge { limit: self.limit }));
                }
                Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Some(Err(BridgeError::FrameDecode(e.to_string())));
                }
                Err(LinesCodecError::Io(e)) => return Some(Err(BridgeError::Io(e))),
            }
        }
    }
}

/// Writes canonicalized JSON records, one per line.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { inner: stream }
    }

    /// Serialize `message` and write it with a trailing LF as one
    /// contiguous write, then flush.
    pub async fn write_one(&mut self, message: &Value) -> Result<()> {
        let mut buf = serde_json::to_vec(message)?;
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write an already-serialized line. The caller guarantees the
    /// string holds exactly one JSON object with no embedded LF.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
