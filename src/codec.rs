//! Frame codec: bytes to [`Frame`]s and back.
//!
//! Both halves implement the `tokio_util::codec` traits so they can drive a `Framed`
//! stream directly, but the gateway feeds them from the [`CodecFilter`](crate::filter::CodecFilter)
//! stage of a session pipeline.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    GatewayError, ProtocolError, Role,
};

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for `role` that rejects frames larger than `max_payload_read`.
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload_read),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = GatewayError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        codec::Decoder::decode(&mut self.decoder, src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = GatewayError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        codec::Encoder::encode(&mut self.encoder, item, dst)
    }
}

/// A decoder for WebSocket frames.
///
/// The decoder is stateless between frames: it only consumes bytes once a whole frame
/// (header and payload) is buffered, so a short read leaves `src` exactly as it was and
/// the caller simply appends the next chunk.
pub struct Decoder {
    role: Role,
    /// Maximum allowed size for a single frame payload.
    max_payload_read: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for the given role and maximum payload size.
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self {
            role,
            max_payload_read,
        }
    }

    /// Decodes every complete frame currently buffered in `src`.
    ///
    /// Bytes of a trailing incomplete frame stay in `src`.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<Frame>, GatewayError> {
        let mut frames = Vec::new();
        while let Some(frame) = codec::Decoder::decode(self, src)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = GatewayError;

    /// Decodes one WebSocket frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a frame was decoded and its bytes consumed.
    /// - `Ok(None)`: more input is needed; `src` is untouched.
    /// - `Err(GatewayError::Protocol)`: the header violates the protocol.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        if src[0] & 0b0111_0000 != 0 {
            return Err(ProtocolError::ReservedBitsNotZero.into());
        }

        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        match (self.role, masked) {
            (Role::Server, false) => return Err(ProtocolError::UnmaskedFrame.into()),
            (Role::Client, true) => return Err(ProtocolError::MaskedFrame.into()),
            _ => {}
        }

        if opcode.is_control() && !fin {
            return Err(ProtocolError::ControlFrameFragmented.into());
        }

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + masked as usize * 4;
        if src.remaining() < header_size {
            return Ok(None);
        }

        let payload_len: u64 = match extra {
            0 => u64::from(length_code),
            2 => u64::from(u16::from_be_bytes([src[2], src[3]])),
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(ProtocolError::LengthOverflow.into());
                }
                len
            }
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ProtocolError::ControlFrameTooLarge(payload_len).into());
        }
        if payload_len > self.max_payload_read as u64 {
            return Err(ProtocolError::FrameTooLarge.into());
        }
        // bounded by max_payload_read, so it fits in usize
        let payload_len = payload_len as usize;

        let mask = if masked {
            let at = 2 + extra;
            Some([src[at], src[at + 1], src[at + 2], src[at + 3]])
        } else {
            None
        };

        let frame_len = header_size + payload_len;
        if src.remaining() < frame_len {
            src.reserve(frame_len - src.remaining());
            return Ok(None);
        }

        src.advance(header_size);
        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame::new(fin, opcode, mask, payload.freeze())))
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// A client-role encoder masks every frame, using the frame's own key when it carries one
/// and a random key otherwise. A server-role encoder never masks.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates an encoder for the given role.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = GatewayError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(ProtocolError::ControlFrameFragmented.into());
            }
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge(frame.payload.len() as u64).into());
            }
        }

        let mask = match self.role {
            Role::Client => Some(frame.mask.unwrap_or_else(rand::random)),
            Role::Server => None,
        };

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..], mask);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(key) = mask {
            apply_mask(&mut dst[start..], key);
        }

        Ok(())
    }
}
