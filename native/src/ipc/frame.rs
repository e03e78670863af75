// 24-byte framed messages for the pipe transport.

use super::error::{ChannelError, ChannelResult};
use super::protocol::{check_payload_size, MAX_PAYLOAD_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// "REND"
pub const FRAME_MAGIC: u32 = 0x5245_4E44;
pub const FRAME_HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Command = 1,
    Result = 2,
}

impl TryFrom<u32> for MessageType {
    type Error = ChannelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::Result),
            other => Err(ChannelError::MalformedFrame(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

/// Header layout: magic @0, type @4, correlation id @8, payload length @16, checksum @20.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub correlation_id: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&(self.message_type as u32).to_le_bytes());
        out[8..16].copy_from_slice(&self.correlation_id.to_le_bytes());
        out[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        // Checksum stays zero.
        out
    }

    /// Validate magic, type and length without looking at any payload.
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> ChannelResult<Self> {
        let field = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        let magic = field(0);
        if magic != FRAME_MAGIC {
            return Err(ChannelError::MalformedFrame(format!(
                "bad magic 0x{:08X}",
                magic
            )));
        }

        let message_type = MessageType::try_from(field(4))?;

        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[8..16]);
        let correlation_id = u64::from_le_bytes(id);

        let payload_len = field(16);
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(ChannelError::MalformedFrame(format!(
                "payload length {} exceeds {}",
                payload_len, MAX_PAYLOAD_SIZE
            )));
        }

        Ok(Self {
            message_type,
            correlation_id,
            payload_len,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Read one complete frame. A short read anywhere means the peer is gone.
pub async fn read_frame<R>(reader: &mut R) -> ChannelResult<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    read_exact_or_disconnect(reader, &mut header_buf).await?;
    let header = FrameHeader::parse(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    read_exact_or_disconnect(reader, &mut payload).await?;

    Ok(Frame { header, payload })
}

/// Write header and payload as one buffer, then flush.
pub async fn write_frame<W>(
    writer: &mut W,
    message_type: MessageType,
    correlation_id: u64,
    payload: &[u8],
) -> ChannelResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    check_payload_size(payload.len())?;

    let header = FrameHeader {
        message_type,
        correlation_id,
        payload_len: payload.len() as u32,
    };

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await.map_err(map_io)?;
    writer.flush().await.map_err(map_io)?;
    Ok(())
}

async fn read_exact_or_disconnect<R>(reader: &mut R, buf: &mut [u8]) -> ChannelResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    reader.read_exact(buf).await.map(|_| ()).map_err(map_io)
}

fn map_io(err: std::io::Error) -> ChannelError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => ChannelError::Disconnected,
        _ => ChannelError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn header_layout_is_fixed() {
        let header = FrameHeader {
            message_type: MessageType::Result,
            correlation_id: 0x1122_3344_5566_7788,
            payload_len: 300,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x44, 0x4E, 0x45, 0x52]);
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &300u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
        assert_eq!(FrameHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn bad_magic_and_type_are_rejected() {
        let mut bytes = FrameHeader {
            message_type: MessageType::Command,
            correlation_id: 1,
            payload_len: 0,
        }
        .to_bytes();

        let mut bad_magic = bytes;
        bad_magic[0] = 0;
        assert!(matches!(
            FrameHeader::parse(&bad_magic),
            Err(ChannelError::MalformedFrame(_))
        ));

        bytes[4..8].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(ChannelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_from_header() {
        let mut bytes = FrameHeader {
            message_type: MessageType::Command,
            correlation_id: 1,
            payload_len: 0,
        }
        .to_bytes();
        bytes[16..20].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(ChannelError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn frame_travels_over_stream() {
        let (mut a, mut b) = duplex(4096);
        write_frame(&mut a, MessageType::Command, 9, b"hello")
            .await
            .unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame.header.message_type, MessageType::Command);
        assert_eq!(frame.header.correlation_id, 9);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn partial_frame_is_a_disconnect() {
        let (mut a, mut b) = duplex(4096);
        let header = FrameHeader {
            message_type: MessageType::Result,
            correlation_id: 4,
            payload_len: 10,
        };
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ChannelError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn oversized_payload_writes_nothing() {
        let (mut a, mut b) = duplex(64);
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = write_frame(&mut a, MessageType::Command, 1, &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Wire(_)));
        drop(a);
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
