//! Frame codec for inter-process traffic.
//!
//! # Wire Format
//!
//! All integers are little-endian.
//!
//! ```text
//! Event: [tag=0][sender u64][receiver u64][send u64][receive u64][sequence u64][anti u8][len u32][payload]
//! Ack:   [tag=1][sender u64][receiver u64][send u64][receive u64][sequence u64][anti u8]
//! ```
//!
//! An `Ack` returns the identity of a received event (or anti-message) to
//! its sender so the sender can stop counting it as in transit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::entity::EntityId;
use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventKey};
use crate::time::VirtualTime;

const TAG_EVENT: u8 = 0;
const TAG_ACK: u8 = 1;
const KEY_LEN: usize = 5 * 8;

/// A decoded frame.
#[derive(Debug)]
pub enum Frame {
    Event(Event),
    Ack { key: EventKey, anti: bool },
}

/// Serialize an event (positive or anti).
pub fn encode_event(event: &Event) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + KEY_LEN + 1 + 4 + event.payload.len());
    buf.put_u8(TAG_EVENT);
    put_key(&mut buf, &event.key());
    buf.put_u8(event.anti as u8);
    buf.put_u32_le(event.payload.len() as u32);
    buf.put_slice(&event.payload);
    buf.freeze()
}

/// Serialize an acknowledgement for `key`.
pub fn encode_ack(key: &EventKey, anti: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + KEY_LEN + 1);
    buf.put_u8(TAG_ACK);
    put_key(&mut buf, key);
    buf.put_u8(anti as u8);
    buf.freeze()
}

/// Decode a frame produced by [`encode_event`] or [`encode_ack`].
pub fn decode(mut frame: Bytes) -> KernelResult<Frame> {
    need(&frame, 1, "tag")?;
    let tag = frame.get_u8();
    need(&frame, KEY_LEN + 1, "event identity")?;
    let key = get_key(&mut frame);
    let anti = match frame.get_u8() {
        0 => false,
        1 => true,
        other => {
            return Err(KernelError::MalformedFrame(format!("anti flag {other}")));
        }
    };
    match tag {
        TAG_EVENT => {
            need(&frame, 4, "payload length")?;
            let len = frame.get_u32_le() as usize;
            need(&frame, len, "payload")?;
            let payload = frame.split_to(len);
            if frame.has_remaining() {
                return Err(KernelError::MalformedFrame(format!(
                    "{} trailing bytes",
                    frame.remaining()
                )));
            }
            Ok(Frame::Event(Event::from_parts(key, anti, payload)))
        }
        TAG_ACK => Ok(Frame::Ack { key, anti }),
        other => Err(KernelError::MalformedFrame(format!("unknown tag {other}"))),
    }
}

fn put_key(buf: &mut BytesMut, key: &EventKey) {
    buf.put_u64_le(key.sender.raw());
    buf.put_u64_le(key.receiver.raw());
    buf.put_u64_le(key.send_time.ticks());
    buf.put_u64_le(key.receive_time.ticks());
    buf.put_u64_le(key.sequence);
}

fn get_key(buf: &mut Bytes) -> EventKey {
    EventKey {
        sender: EntityId::new(buf.get_u64_le()),
        receiver: EntityId::new(buf.get_u64_le()),
        send_time: VirtualTime::new(buf.get_u64_le()),
        receive_time: VirtualTime::new(buf.get_u64_le()),
        sequence: buf.get_u64_le(),
    }
}

fn need(buf: &Bytes, len: usize, what: &str) -> KernelResult<()> {
    if buf.remaining() < len {
        return Err(KernelError::MalformedFrame(format!(
            "truncated {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}
