use bytes::BytesMut;
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    codec::Codec,
    pipeline::{Event, Filter, NextFilter, NextWrite, Payload},
    Result, Role,
};

/// Turns received bytes into frames and written frames into bytes.
///
/// Input is buffered until a whole frame is available, so the transport may deliver bytes
/// in arbitrarily small chunks. After a decoding error the filter drops all further input.
pub struct CodecFilter {
    codec: Codec,
    buffer: BytesMut,
    failed: bool,
}

impl CodecFilter {
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self {
            codec: Codec::new(role, max_payload_read),
            buffer: BytesMut::with_capacity(8192),
            failed: false,
        }
    }

    fn decode(&mut self, next: &mut NextFilter<'_>) -> Result<()> {
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            next.fire(Event::MessageReceived(Payload::Frame(frame)))?;
        }
        Ok(())
    }
}

impl Filter for CodecFilter {
    fn on_event(&mut self, event: Event, next: &mut NextFilter<'_>) -> Result<()> {
        match event {
            Event::MessageReceived(Payload::Raw(bytes)) => {
                if self.failed {
                    return Ok(());
                }

                self.buffer.extend_from_slice(&bytes);
                let res = self.decode(next);
                if res.is_err() {
                    self.failed = true;
                    self.buffer.clear();
                }
                res
            }
            event => next.fire(event),
        }
    }

    fn filter_write(&mut self, payload: Payload, next: &mut NextWrite<'_>) -> Result<()> {
        match payload {
            Payload::Frame(frame) => {
                let mut buf = BytesMut::with_capacity(frame.payload.len() + 14);
                self.codec.encode(frame, &mut buf)?;
                next.write(Payload::Raw(buf.freeze()))
            }
            payload => next.write(payload),
        }
    }
}
