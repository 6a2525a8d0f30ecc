//! Length-prefixed binary framing for TCP sessions.
//!
//! Wire format: 1-byte kind tag + 4-byte little-endian payload length +
//! payload bytes. A header is always exactly [`HEADER_LEN`] bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;

/// Header size in bytes: kind tag + u32 length.
pub const HEADER_LEN: usize = 5;

/// What a frame's payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Raw UTF-8 text, no envelope.
    Text = 1,
    /// UTF-8 JSON [`Envelope`](crate::message::Envelope).
    Object = 2,
}

impl FrameKind {
    /// The wire tag for this kind.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Map a wire tag back to a kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Text),
            2 => Some(Self::Object),
            _ => None,
        }
    }
}

/// One unit on the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Header plus payload as one contiguous buffer.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let len = u32::try_from(self.payload.len()).map_err(|_| NetworkError::FrameTooLarge {
            len: self.payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind.tag());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Write one frame and flush.
///
/// The header and payload go out in a single `write_all` of one buffer, so a
/// caller holding the connection's write lock never leaves a partial frame
/// behind for another writer to interleave with.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly, i.e. the very
/// first header byte hit end-of-stream. End-of-stream anywhere after that is
/// a transport error. The length is checked against `max_len` before any
/// payload buffer is allocated.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];

    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    read_exact_or_transport(reader, &mut header[1..], "frame header").await?;

    let kind = FrameKind::from_tag(header[0])
        .ok_or_else(|| NetworkError::Protocol(format!("unknown frame kind {}", header[0])))?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > max_len {
        return Err(NetworkError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_transport(reader, &mut payload, "frame payload").await?;

    Ok(Some(Frame { kind, payload }))
}

async fn read_exact_or_transport<R>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), NetworkError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(NetworkError::Transport(
            format!("stream ended inside {what}"),
        )),
        Err(e) => Err(NetworkError::Io(e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
