//! Line-delimited JSON framing
//!
//! Each frame is one JSON object followed by `\n`. Blank lines are
//! ignored. The reader refuses frames longer than its limit instead of
//! buffering them.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::ProtocolError;

/// Default frame limit (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reads framed records from a byte stream
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame_bytes,
            buf: Vec::new(),
        }
    }

    /// Read the next record. `Ok(None)` means the peer closed the stream
    /// cleanly between frames.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            self.buf.clear();
            let limit = self.max_frame_bytes as u64 + 1;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if read == 0 {
                return Ok(None);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            if !terminated {
                if self.buf.len() > self.max_frame_bytes {
                    return Err(ProtocolError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                return Err(ProtocolError::Truncated);
            }

            let line = &self.buf[..self.buf.len() - 1];
            if line.len() > self.max_frame_bytes {
                return Err(ProtocolError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(serde_json::from_slice(line)?));
        }
    }
}

/// Writes framed records to a byte stream
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn send<T: Serialize>(&mut self, record: &T) -> Result<(), ProtocolError> {
        let mut frame = serde_json::to_vec(record)?;
        frame.push(b'\n');
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CoordinatorMessage, WorkerMessage};

    #[tokio::test]
    async fn test_writer_then_reader() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer.send(&WorkerMessage::Heartbeat).await.unwrap();
        writer
            .send(&CoordinatorMessage::Rejected {
                reason: "dup".to_string(),
            })
            .await
            .unwrap();
        drop(writer);

        let mut reader = FrameReader::new(server, 1024);
        let first: WorkerMessage = reader.next().await.unwrap().unwrap();
        assert_eq!(first, WorkerMessage::Heartbeat);
        let second: CoordinatorMessage = reader.next().await.unwrap().unwrap();
        assert_eq!(second.kind_name(), "rejected");
        assert!(reader.next::<WorkerMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let input: &[u8] = b"\n  \n{\"type\":\"heartbeat\"}\n";
        let mut reader = FrameReader::new(input, 1024);
        let msg: WorkerMessage = reader.next().await.unwrap().unwrap();
        assert_eq!(msg, WorkerMessage::Heartbeat);
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let mut input = vec![b'x'; 64];
        input.push(b'\n');
        let mut reader = FrameReader::new(input.as_slice(), 16);
        let err = reader.next::<WorkerMessage>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let input: &[u8] = b"{\"type\":\"teleport\"}\n";
        let mut reader = FrameReader::new(input, 1024);
        let err = reader.next::<WorkerMessage>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let input: &[u8] = b"{\"type\":\"heart";
        let mut reader = FrameReader::new(input, 1024);
        let err = reader.next::<WorkerMessage>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(b"{\"type\":")
            .read(b"\"heartbeat\"}\n{\"type\"")
            .read(b":\"heartbeat\"}\n")
            .build();
        let mut reader = FrameReader::new(stream, 1024);
        for _ in 0..2 {
            let msg: WorkerMessage = reader.next().await.unwrap().unwrap();
            assert_eq!(msg, WorkerMessage::Heartbeat);
        }
        assert!(reader.next::<WorkerMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writer_emits_one_line_per_record() {
        let stream = tokio_test::io::Builder::new()
            .write(b"{\"type\":\"heartbeat\"}\n")
            .build();
        let mut writer = FrameWriter::new(stream);
        writer.send(&WorkerMessage::Heartbeat).await.unwrap();
    }
}
