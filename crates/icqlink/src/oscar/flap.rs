//! FLAP framing, the outer envelope of every byte exchanged with a server.
//!
//! A frame is `0x2A | channel | seq (u16 BE) | len (u16 BE) | body`.
//! Outbound frames reserve the length field and back-patch it; inbound bytes
//! are accumulated until a whole frame is available, with a hard reset on a
//! bad start byte.

use bytes::BytesMut;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::buffer::{Buffer, SizeMarker};

/// FLAP frame start byte.
pub const FLAP_START: u8 = 0x2a;

/// Size of the FLAP header.
pub const FLAP_HDRLEN: usize = 6;

/// FLAP channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Sign-on handshake.
    SignOn,
    /// SNAC data.
    Snac,
    /// FLAP-level error.
    Error,
    /// Sign-off / server-initiated disconnect.
    SignOff,
    /// Keep-alive.
    KeepAlive,
    /// Anything else; preserved for logging.
    Other(u8),
}

impl Channel {
    /// Channel byte on the wire.
    pub fn as_u8(self) -> u8 {
        match self {
            Channel::SignOn => 1,
            Channel::Snac => 2,
            Channel::Error => 3,
            Channel::SignOff => 4,
            Channel::KeepAlive => 5,
            Channel::Other(c) => c,
        }
    }

    /// Classify a wire channel byte.
    pub fn from_u8(c: u8) -> Self {
        match c {
            1 => Channel::SignOn,
            2 => Channel::Snac,
            3 => Channel::Error,
            4 => Channel::SignOff,
            5 => Channel::KeepAlive,
            other => Channel::Other(other),
        }
    }
}

/// FLAP frame header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FlapHeader {
    /// Always [`FLAP_START`].
    pub start: u8,
    /// Channel byte.
    pub channel: u8,
    /// Sequence number, incremented mod 0x8000.
    pub seq: U16,
    /// Body length.
    pub len: U16,
}

/// A complete inbound frame.
#[derive(Debug)]
pub struct Frame {
    /// Channel the frame arrived on.
    pub channel: Channel,
    /// Frame sequence number.
    pub seq: u16,
    /// Frame body, cursor at the start.
    pub body: Buffer,
}

/// Begin an outbound frame; returns the marker for [`finish_frame`].
pub fn begin_frame(b: &mut Buffer, channel: Channel, seq: u16) -> SizeMarker {
    b.write_u8(FLAP_START);
    b.write_u8(channel.as_u8());
    b.write_u16_be(seq);
    b.mark_u16_be()
}

/// Back-patch the length field of a frame begun with [`begin_frame`].
pub fn finish_frame(b: &mut Buffer, marker: SizeMarker) {
    b.patch_size(marker);
}

/// Outcome of one assembler step.
#[derive(Debug)]
pub enum Assembled {
    /// A whole frame was extracted.
    Frame(Frame),
    /// More bytes are needed.
    Incomplete,
    /// The stream did not start with 0x2A; pending bytes were discarded.
    BadStart(u8),
}

/// Incremental splitter of a TCP byte stream into FLAP frames.
///
/// Multiple frames in one read are handled by calling [`FrameAssembler::next`]
/// in a loop until it reports `Incomplete`.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: BytesMut,
}

impl FrameAssembler {
    /// New empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes received from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet framed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Try to extract the next complete frame.
    pub fn next(&mut self) -> Assembled {
        if self.pending.is_empty() {
            return Assembled::Incomplete;
        }
        if self.pending[0] != FLAP_START {
            let bad = self.pending[0];
            self.pending.clear();
            return Assembled::BadStart(bad);
        }
        if self.pending.len() < FLAP_HDRLEN {
            return Assembled::Incomplete;
        }

        let (header, _) = FlapHeader::ref_from_prefix(&self.pending[..])
            .expect("six bytes are present and the header is unaligned");
        let body_len = header.len.get() as usize;
        if self.pending.len() < FLAP_HDRLEN + body_len {
            return Assembled::Incomplete;
        }

        let channel = Channel::from_u8(header.channel);
        let seq = header.seq.get();
        let frame = self.pending.split_to(FLAP_HDRLEN + body_len);
        Assembled::Frame(Frame {
            channel,
            seq,
            body: Buffer::from_bytes(&frame[FLAP_HDRLEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(channel: Channel, seq: u16, body: &[u8]) -> Vec<u8> {
        let mut b = Buffer::new();
        let m = begin_frame(&mut b, channel, seq);
        b.write_bytes(body);
        finish_frame(&mut b, m);
        b.into_vec()
    }

    #[test]
    fn test_frame_round_trip() {
        let bytes = emit(Channel::SignOn, 0x1234, &[0, 0, 0, 1]);
        assert_eq!(bytes, [0x2a, 0x01, 0x12, 0x34, 0x00, 0x04, 0, 0, 0, 1]);

        let mut asm = FrameAssembler::new();
        asm.feed(&bytes);
        match asm.next() {
            Assembled::Frame(f) => {
                assert_eq!(f.channel, Channel::SignOn);
                assert_eq!(f.seq, 0x1234);
                assert_eq!(f.body.as_slice(), &[0, 0, 0, 1]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(matches!(asm.next(), Assembled::Incomplete));
    }

    #[test]
    fn test_length_field_covers_body_exactly() {
        let bytes = emit(Channel::Snac, 1, &[9; 300]);
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 300);
        assert_eq!(bytes.len(), FLAP_HDRLEN + 300);
    }

    #[test]
    fn test_partial_then_complete() {
        let bytes = emit(Channel::KeepAlive, 7, &[]);
        let mut asm = FrameAssembler::new();
        asm.feed(&bytes[..3]);
        assert!(matches!(asm.next(), Assembled::Incomplete));
        asm.feed(&bytes[3..]);
        assert!(matches!(asm.next(), Assembled::Frame(_)));
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut bytes = emit(Channel::Snac, 1, &[1]);
        bytes.extend(emit(Channel::Snac, 2, &[2]));
        let mut asm = FrameAssembler::new();
        asm.feed(&bytes);
        let (mut seqs, mut n) = (Vec::new(), 0);
        while let Assembled::Frame(f) = asm.next() {
            seqs.push(f.seq);
            n += 1;
        }
        assert_eq!(n, 2);
        assert_eq!(seqs, [1, 2]);
    }

    #[test]
    fn test_bad_start_byte_clears_and_recovers() {
        let mut asm = FrameAssembler::new();
        asm.feed(&[0x99, 0x01, 0x02]);
        assert!(matches!(asm.next(), Assembled::BadStart(0x99)));
        assert_eq!(asm.pending_len(), 0);
        // well-formed bytes afterwards parse normally
        asm.feed(&emit(Channel::SignOn, 1, &[0, 0, 0, 1]));
        assert!(matches!(asm.next(), Assembled::Frame(_)));
    }
}
