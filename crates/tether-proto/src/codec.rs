//! Streaming packet codec for byte transports

use crate::{DecodeError, FrameError, Packet, ProtocolError, Tag};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum packet size (16MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Reassembles packets from an arbitrarily chunked byte stream.
///
/// Packets carry no outer length prefix; the extent is found by walking the
/// header chain. A complete packet whose contents fail to decode is consumed
/// and reported as [`FrameError::Malformed`], so later packets still parse.
pub struct PacketCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum packet size allowed
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Create a new codec with a custom max packet size
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_packet_size,
        }
    }

    /// Maximum packet size this codec accepts
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Encode a packet, enforcing the size limit
    pub fn encode_packet(&self, packet: &Packet) -> Result<Bytes, DecodeError> {
        let size = packet.encoded_len();
        if size > self.max_packet_size {
            return Err(DecodeError::TooLarge {
                size,
                max: self.max_packet_size,
            });
        }
        Ok(packet.encode())
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Take the next complete packet out of the buffer, if any
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        let extent = match Packet::peek_len(&self.read_buf, self.max_packet_size) {
            Ok(Some(extent)) => extent,
            Ok(None) => return Ok(None),
            Err(DecodeError::TooLarge { size, max }) => {
                return Err(FrameError::TooLarge { size, max });
            }
            Err(error) => {
                // peek_len only reports size violations
                return Err(FrameError::Malformed {
                    tag: self.pending_tag(),
                    error,
                });
            }
        };

        let data = self.read_buf.split_to(extent);
        Packet::decode(&data).map(Some).map_err(|error| FrameError::Malformed {
            tag: Tag::from_raw((&data[..4]).get_u32()),
            error,
        })
    }

    /// Write a packet to an async writer
    pub async fn write_packet<W>(&self, writer: &mut W, packet: &Packet) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_packet(packet)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a packet from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream.
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> Result<Option<Packet>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(packet) = self.next_packet()? {
                return Ok(Some(packet));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::UnexpectedEof);
                }
            }

            self.push(&temp_buf[..n]);
        }
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Clear the internal buffer
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
    }

    fn pending_tag(&self) -> Tag {
        if self.read_buf.len() >= 4 {
            Tag::from_raw((&self.read_buf[..4]).get_u32())
        } else {
            Tag::from_raw(0)
        }
    }
}
