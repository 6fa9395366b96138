//! Framed JSON messaging over a Unix stream socket.
//!
//! The handoff control channel carries small JSON messages wrapped in a
//! fixed envelope:
//!
//! ```text
//! +----+----+----+----+----+----+----+----+----...----+
//! | 'Z'| 'E'| 'R'| 'O'| len_le32 (4 bytes)            | json body
//! +----+----+----+----+----+----+----+----+----...----+
//! ```
//!
//! Every read and write honors an absolute deadline set with
//! [`Messenger::set_deadline`]; expiry surfaces as [`Error::Timeout`],
//! which the handoff protocol treats differently from generic I/O
//! failure.

use std::future::Future;
use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, Result};

/// Little-endian "ZERO".
const FRAME_MAGIC: u32 = 0x5A45_524F;

/// Upper bound on a received payload. The protocol's messages are tens of
/// bytes; anything bigger means a corrupt peer and the stream is abandoned.
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// One end of the handoff control channel.
///
/// Owns the underlying connection; dropping it releases the descriptor and
/// unblocks the peer with an error.
pub struct Messenger {
    stream: UnixStream,
    deadline: Option<Instant>,
}

impl Messenger {
    /// Wraps an already-connected Unix stream socket.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(stream)?,
            deadline: None,
        })
    }

    /// A connected messenger pair over an anonymous socketpair.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_std(a)?, Self::from_std(b)?))
    }

    /// Sets the absolute deadline applied to every subsequent send and
    /// receive. Each protocol phase resets this before its exchange.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Sends one message.
    pub async fn send<T: Serialize>(&mut self, v: &T) -> Result<()> {
        let payload = serde_json::to_vec(v)?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        deadline_io(self.deadline, self.stream.write_all(&frame)).await
    }

    /// Receives one message.
    ///
    /// A header with the wrong magic is rejected without consuming any
    /// payload bytes. A sender that produced a valid header is trusted to
    /// follow it with exactly `len` bytes of JSON.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut header = [0u8; 8];
        deadline_io(self.deadline, self.stream.read_exact(&mut header)).await?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if magic != FRAME_MAGIC || len > MAX_PAYLOAD {
            return Err(Error::BadFrame);
        }
        let mut payload = vec![0u8; len as usize];
        deadline_io(self.deadline, self.stream.read_exact(&mut payload)).await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

async fn deadline_io<F, T>(deadline: Option<Instant>, op: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(at) => match timeout_at(at, op).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(Error::Timeout),
        },
        None => Ok(op.await?),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct TestMsg {
        int: i64,
        string: String,
        binary: Vec<u8>,
    }

    fn big_msg() -> TestMsg {
        let mut binary = vec![0u8; 35000];
        binary[0] = 42;
        binary[34999] = 43;
        TestMsg {
            int: 66,
            string: "framed JSON".to_string(),
            binary,
        }
    }

    #[tokio::test]
    async fn test_round_trip_both_directions() {
        let (mut a, mut b) = Messenger::pair().unwrap();
        let msg = big_msg();

        let sent = msg.clone();
        let writer = tokio::spawn(async move {
            a.send(&sent).await.unwrap();
            let reply: TestMsg = a.recv().await.unwrap();
            assert_eq!(reply.int, 77);
            a
        });

        let got: TestMsg = b.recv().await.unwrap();
        assert_eq!(got, msg);
        b.send(&TestMsg {
            int: 77,
            string: "reply".to_string(),
            binary: vec![],
        })
        .await
        .unwrap();

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline_expires_as_timeout() {
        let (mut a, _b) = Messenger::pair().unwrap();
        a.set_deadline(Instant::now() + Duration::from_millis(100));
        let err = a.recv::<TestMsg>().await.unwrap_err();
        assert!(err.is_timeout(), "expected Timeout, got {err:?}");
    }

    #[tokio::test]
    async fn test_deadline_in_the_future_does_not_fire() {
        let (mut a, mut b) = Messenger::pair().unwrap();
        a.set_deadline(Instant::now() + Duration::from_secs(5));
        b.send(&TestMsg {
            int: 1,
            string: String::new(),
            binary: vec![],
        })
        .await
        .unwrap();
        let got: TestMsg = a.recv().await.unwrap();
        assert_eq!(got.int, 1);
    }

    #[tokio::test]
    async fn test_peer_close_is_io_error_not_timeout() {
        let (mut a, b) = Messenger::pair().unwrap();
        drop(b);
        let err = a.recv::<TestMsg>().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_bad_magic_rejected_without_eating_payload() {
        let (mut a, b) = Messenger::pair().unwrap();
        let mut raw = b.stream;

        // A corrupt 8-byte header followed by a well-formed frame.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        let payload = serde_json::to_vec(&TestMsg {
            int: 9,
            string: String::new(),
            binary: vec![],
        })
        .unwrap();
        bytes.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        raw.write_all(&bytes).await.unwrap();

        let err = a.recv::<TestMsg>().await.unwrap_err();
        assert!(matches!(err, Error::BadFrame), "got {err:?}");

        // Only the corrupt header was consumed; the next frame is intact.
        let got: TestMsg = a.recv().await.unwrap();
        assert_eq!(got.int, 9);
    }

    #[tokio::test]
    async fn test_oversized_length_is_a_bad_frame() {
        let (mut a, b) = Messenger::pair().unwrap();
        let mut raw = b.stream;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        raw.write_all(&bytes).await.unwrap();

        let err = a.recv::<TestMsg>().await.unwrap_err();
        assert!(matches!(err, Error::BadFrame), "got {err:?}");
    }
}
