//! RTP header inspection and the sequence/timestamp switching context.
//!
//! When the peer re-offers (or otherwise restarts its stream) the SSRC,
//! sequence numbers and timestamps it sends change underneath the WebRTC
//! side. The switching context rebases both counters so the stream the
//! gateway sees stays monotonic across such switches.

use byteorder::{BigEndian, ByteOrder};

/// Default timestamp strides used until the real one has been observed:
/// 20 ms of 48 kHz audio and a 90 kHz video frame at ~20 fps.
pub(crate) const DEFAULT_AUDIO_STEP: u32 = 960;
pub(crate) const DEFAULT_VIDEO_STEP: u32 = 4500;

const RTP_HEADER_LEN: usize = 12;

/// The fixed-header fields the bridge cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RtpHeader {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
}

impl RtpHeader {
    /// Validate the packet and pull out SSRC, sequence number and timestamp.
    pub(crate) fn parse(buf: &[u8]) -> Option<RtpHeader> {
        let packet = rtp_types::RtpPacket::parse(buf).ok()?;

        Some(RtpHeader {
            ssrc: packet.ssrc(),
            sequence_number: packet.sequence_number(),
            timestamp: packet.timestamp(),
        })
    }

    /// Patch sequence number and timestamp in place.
    pub(crate) fn patch(buf: &mut [u8], sequence_number: u16, timestamp: u32) {
        debug_assert!(buf.len() >= RTP_HEADER_LEN);

        BigEndian::write_u16(&mut buf[2..4], sequence_number);
        BigEndian::write_u32(&mut buf[4..8], timestamp);
    }
}

/// Rebases sequence numbers and timestamps across SSRC switches.
///
/// On every switch the previous stream's last values become the base the
/// new stream continues from; `step` bridges the timestamp gap between the
/// two streams. The arithmetic is wrapping on purpose, both counters roll
/// over in normal operation.
#[derive(Debug, Default)]
pub(crate) struct RtpSwitchingContext {
    last_ssrc: Option<u32>,

    base_ts: u32,
    base_ts_prev: u32,
    last_ts: u32,

    base_seq: u16,
    base_seq_prev: u16,
    last_seq: u16,
}

impl RtpSwitchingContext {
    /// Feed one incoming header, returns the rewritten (seq, ts) pair.
    pub(crate) fn update(&mut self, header: &RtpHeader, step: u32) -> (u16, u32) {
        if self.last_ssrc != Some(header.ssrc) {
            self.last_ssrc = Some(header.ssrc);
            self.base_ts_prev = self.last_ts;
            self.base_ts = header.timestamp;
            self.base_seq_prev = self.last_seq;
            self.base_seq = header.sequence_number;
        }

        self.last_ts = header
            .timestamp
            .wrapping_sub(self.base_ts)
            .wrapping_add(self.base_ts_prev)
            .wrapping_add(step);
        self.last_seq = header
            .sequence_number
            .wrapping_sub(self.base_seq)
            .wrapping_add(self.base_seq_prev)
            .wrapping_add(1);

        (self.last_seq, self.last_ts)
    }
}

/// Learns the timestamp stride of a stream from its first two packets.
///
/// A bootstrap over two packets is an approximation: packet loss right at
/// the start can inflate the stride. It only affects how large the jump
/// inserted at an SSRC switch is, never stream correctness.
#[derive(Debug, Default)]
pub(crate) struct StrideEstimate {
    first_ts: Option<u32>,
    step: Option<u32>,
}

impl StrideEstimate {
    pub(crate) fn observe(&mut self, timestamp: u32) {
        match (self.first_ts, self.step) {
            (None, _) => self.first_ts = Some(timestamp),
            (Some(first), None) => {
                let step = timestamp.wrapping_sub(first);
                // a reordered packet would yield a huge "negative" stride
                if (step as i32) > 0 {
                    self.step = Some(step);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn step_or(&self, fallback: u32) -> u32 {
        self.step.unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(ssrc: u32, seq: u16, ts: u32) -> RtpHeader {
        RtpHeader {
            ssrc,
            sequence_number: seq,
            timestamp: ts,
        }
    }

    fn raw_packet(ssrc: u32, seq: u16, ts: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        buf[0] = 0x80;
        buf[1] = 96;
        BigEndian::write_u16(&mut buf[2..4], seq);
        BigEndian::write_u32(&mut buf[4..8], ts);
        BigEndian::write_u32(&mut buf[8..12], ssrc);
        buf
    }

    #[test]
    fn parse_and_patch() {
        let mut buf = raw_packet(0xdecafbad, 700, 144000);

        let parsed = RtpHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header(0xdecafbad, 700, 144000));

        RtpHeader::patch(&mut buf, 701, 144960);
        let parsed = RtpHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header(0xdecafbad, 701, 144960));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(RtpHeader::parse(&[0u8; 4]).is_none());
    }

    #[test]
    fn first_stream_is_rebased_to_zero() {
        let mut ctx = RtpSwitchingContext::default();

        let (seq, ts) = ctx.update(&header(1, 100, 10_000), 960);
        assert_eq!(seq, 1);
        assert_eq!(ts, 960);

        let (seq, ts) = ctx.update(&header(1, 101, 10_960), 960);
        assert_eq!(seq, 2);
        assert_eq!(ts, 1920);
    }

    #[test]
    fn ssrc_switch_stays_monotonic() {
        let mut ctx = RtpSwitchingContext::default();

        let mut last = (0u16, 0u32);
        for i in 0..10u32 {
            last = ctx.update(&header(1, 100 + i as u16, 10_000 + i * 960), 960);
        }

        // new stream with completely different counters
        let (seq, ts) = ctx.update(&header(2, 9_000, 777_000), 960);
        assert_eq!(seq, last.0.wrapping_add(1));
        assert_eq!(ts, last.1.wrapping_add(960));

        let (seq2, ts2) = ctx.update(&header(2, 9_001, 777_960), 960);
        assert_eq!(seq2, seq.wrapping_add(1));
        assert_eq!(ts2, ts.wrapping_add(960));
    }

    #[test]
    fn seq_wraparound() {
        let mut ctx = RtpSwitchingContext::default();

        ctx.update(&header(1, u16::MAX - 1, 0), 960);
        let (seq, _) = ctx.update(&header(1, u16::MAX, 960), 960);
        let (wrapped, _) = ctx.update(&header(1, 0, 1920), 960);

        assert_eq!(wrapped, seq.wrapping_add(1));
    }

    #[test]
    fn stride_bootstrap() {
        let mut stride = StrideEstimate::default();
        assert_eq!(stride.step_or(960), 960);

        stride.observe(1000);
        assert_eq!(stride.step_or(960), 960);

        stride.observe(1160);
        assert_eq!(stride.step_or(960), 160);

        // later observations don't move it
        stride.observe(99_999);
        assert_eq!(stride.step_or(960), 160);
    }
}
