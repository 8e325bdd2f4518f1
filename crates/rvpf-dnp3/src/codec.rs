use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_DNP};
use tokio_util::codec::{Decoder, Encoder};

use rvpf_core::ProtocolError;

const CRC_DNP: Crc<u16> = Crc::<u16>::new(&CRC_16_DNP);

/// Start bytes opening every data-link frame.
pub const FRAME_START: [u8; 2] = [0x05, 0x64];

/// Largest user payload a single frame carries.
pub const MAX_FRAME_PAYLOAD: usize = 250;

/// Header (10) + payload (250) + one CRC per 16-byte block (32).
pub const MAX_FRAME_SIZE: usize = 292;

const HEADER_SIZE: usize = 10;

/// A data-link frame: header fields plus the user payload, CRCs stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub control: u8,
    pub destination: u16,
    pub source: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Size of the frame on the wire, block CRCs included.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + self.payload.chunks(16).count() * 2
    }
}

/// Frame encoder/decoder over a raw byte stream.
///
/// The header CRC covers the 8 header bytes; the payload is cut into
/// 16-byte blocks each followed by its own CRC, little-endian. Decoding
/// buffers partial frames across reads, resynchronizes on a corrupt
/// header by advancing one byte, and reports a corrupt body as
/// `FrameCorrupt` after consuming the whole frame so the caller can drop
/// it and continue reading.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::Io(format!(
                "frame payload of {} exceeds {MAX_FRAME_PAYLOAD} bytes",
                item.payload.len()
            )));
        }

        dst.reserve(item.encoded_len());

        let header_start = dst.len();
        dst.put_slice(&FRAME_START);
        dst.put_u8((5 + item.payload.len()) as u8);
        dst.put_u8(item.control);
        dst.put_u16_le(item.destination);
        dst.put_u16_le(item.source);
        let header_crc = CRC_DNP.checksum(&dst[header_start..header_start + 8]);
        dst.put_u16_le(header_crc);

        for chunk in item.payload.chunks(16) {
            dst.put_slice(chunk);
            dst.put_u16_le(CRC_DNP.checksum(chunk));
        }

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            // Hunt for the start bytes.
            while !src.is_empty() && src[0] != FRAME_START[0] {
                src.advance(1);
            }
            if src.len() >= 2 && src[1] != FRAME_START[1] {
                src.advance(1);
                continue;
            }
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header_crc_calc = CRC_DNP.checksum(&src[0..8]);
            let header_crc_read = u16::from_le_bytes([src[8], src[9]]);
            if header_crc_calc != header_crc_read {
                src.advance(1);
                continue;
            }

            let length = src[2] as usize;
            if length < 5 {
                src.advance(1);
                continue;
            }

            let body_len = length - 5;
            let blocks = body_len.div_ceil(16);
            let total = HEADER_SIZE + body_len + blocks * 2;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let control = src[3];
            let destination = u16::from_le_bytes([src[4], src[5]]);
            let source = u16::from_le_bytes([src[6], src[7]]);

            let mut payload = Vec::with_capacity(body_len);
            let mut cursor = HEADER_SIZE;
            let mut remaining = body_len;
            let mut corrupt = false;
            while remaining > 0 {
                let chunk = remaining.min(16);
                let data = &src[cursor..cursor + chunk];
                let crc_read =
                    u16::from_le_bytes([src[cursor + chunk], src[cursor + chunk + 1]]);
                if CRC_DNP.checksum(data) != crc_read {
                    corrupt = true;
                    break;
                }
                payload.extend_from_slice(data);
                cursor += chunk + 2;
                remaining -= chunk;
            }

            src.advance(total);
            if corrupt {
                return Err(ProtocolError::FrameCorrupt);
            }

            return Ok(Some(Frame {
                control,
                destination,
                source,
                payload,
            }));
        }
    }
}

/// Encode a frame into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    FrameCodec
        .encode(frame.clone(), &mut buf)
        .expect("payload bounded by caller");
    buf
}
