//! RTCP helpers: SSRC rewriting for relayed compound packets and the PLI
//! used to kickstart a keyframe when video recording starts.

use byteorder::{BigEndian, ByteOrder};
use rtcp_types::{PayloadFeedback, Pli, RtcpPacketWriter, RtcpPacketWriterExt};

const RTCP_SR: u8 = 200;
const RTCP_RR: u8 = 201;
const RTCP_SDES: u8 = 202;
const RTCP_BYE: u8 = 203;
const RTCP_RTPFB: u8 = 205;
const RTCP_PSFB: u8 = 206;

/// Rewrite the SSRC identifiers of a compound RTCP packet in place.
///
/// Feedback generated on the WebRTC side carries the gateway's SSRCs; the
/// legacy peer only knows the SSRC we send towards it (`local_ssrc`) and
/// its own (`peer_ssrc`). Sender/source fields become `local_ssrc`, media
/// and report-block targets become `peer_ssrc`.
///
/// Packets that fail the compound framing checks are left untouched.
pub(crate) fn fix_ssrcs(buf: &mut [u8], local_ssrc: u32, peer_ssrc: u32) {
    let mut offset = 0;

    while buf.len() - offset >= 4 {
        let header = &buf[offset..];

        // version must be 2
        if header[0] >> 6 != 2 {
            return;
        }

        let pt = header[1];
        let len = 4 * (BigEndian::read_u16(&header[2..4]) as usize + 1);

        if len > buf.len() - offset {
            return;
        }

        let packet = &mut buf[offset..offset + len];

        match pt {
            RTCP_SR => {
                if packet.len() >= 8 {
                    BigEndian::write_u32(&mut packet[4..8], local_ssrc);
                }
                // first report block refers to the stream we receive
                if packet.len() >= 32 && peer_ssrc != 0 {
                    BigEndian::write_u32(&mut packet[28..32], peer_ssrc);
                }
            }
            RTCP_RR => {
                if packet.len() >= 8 {
                    BigEndian::write_u32(&mut packet[4..8], local_ssrc);
                }
                if packet.len() >= 12 && peer_ssrc != 0 {
                    BigEndian::write_u32(&mut packet[8..12], peer_ssrc);
                }
            }
            RTCP_SDES | RTCP_BYE => {
                if packet.len() >= 8 {
                    BigEndian::write_u32(&mut packet[4..8], local_ssrc);
                }
            }
            RTCP_RTPFB | RTCP_PSFB => {
                if packet.len() >= 8 {
                    BigEndian::write_u32(&mut packet[4..8], local_ssrc);
                }
                if packet.len() >= 12 && peer_ssrc != 0 {
                    BigEndian::write_u32(&mut packet[8..12], peer_ssrc);
                }
            }
            _ => {}
        }

        offset += len;
    }
}

/// Build a Picture Loss Indication.
///
/// SSRC fields are left zero, the gateway rewrites them on its side of the
/// relay the same way [`fix_ssrcs`] does on ours.
pub(crate) fn pli() -> Vec<u8> {
    let pli = PayloadFeedback::builder_owned(Pli::builder())
        .sender_ssrc(0)
        .media_ssrc(0);

    let size = pli
        .calculate_size()
        .expect("static PLI layout always sizes");
    let mut data = vec![0; size];
    let written = pli
        .write_into(&mut data)
        .expect("buffer is sized to the packet");
    data.truncate(written);

    data
}
