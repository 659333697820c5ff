//! SDP rewriting: the generate path rewrites a JSEP description into the
//! plain SDP we advertise to the peer, the ingest path pulls the remote
//! endpoint and keying out of the peer's description.

use crate::config::Config;
use crate::error::PluginError;
use crate::crypto;
use crate::session::{Kind, MediaState, Session};
use nosip_sdp::{
    Connection, MediaKind, MediaSection, Sdp, SrtpCrypto, SrtpKeyingMaterial, SrtpSuite,
    TaggedAddress, TransportProtocol,
};
use std::net::IpAddr;

/// Rewrite `sdp` in place to advertise our side of the bridge and return
/// the serialized text.
///
/// Every media line gets the negotiated profile and the local connection
/// address; audio/video lines get their allocated RTP port and, when SDES
/// is on, a single SHA1_80 crypto attribute with fresh keying material.
pub(crate) fn manipulate(
    config: &Config,
    media: &mut MediaState,
    sdp: &mut Sdp,
    answer: bool,
) -> String {
    let proto = if media.require_srtp {
        TransportProtocol::RtpSavp
    } else {
        TransportProtocol::RtpAvp
    };

    log::debug!("setting protocol to {proto}");

    let local = Connection {
        address: TaggedAddress::from(config.local_ip),
    };

    sdp.connection = Some(local.clone());

    for section in &mut sdp.media {
        section.media.proto = proto.clone();
        section.connection = Some(local.clone());

        let kind = match section.media.kind {
            MediaKind::Audio => Kind::Audio,
            MediaKind::Video => Kind::Video,
            _ => continue,
        };

        section.media.port = media.line(kind).local_rtp_port;

        if media.has_srtp_local {
            match crypto::set_local(media, kind) {
                Ok(key) => {
                    section.crypto = vec![SrtpCrypto {
                        tag: 1,
                        suite: SrtpSuite::AES_CM_128_HMAC_SHA1_80,
                        keys: vec![SrtpKeyingMaterial {
                            key_and_salt: key.into(),
                            lifetime: None,
                            mki: None,
                        }],
                        params: vec![],
                    }];
                }
                Err(e) => {
                    log::error!("error creating outbound SRTP context: {e}");
                }
            }
        }

        if answer {
            latch_payload_type(media, kind, section);
        }
    }

    sdp.to_string()
}

/// Ingest the peer's description.
///
/// Returns whether the remote endpoint (address or an RTP port) differs
/// from what the session had. During an update only IP/port changes are
/// honoured, attributes are left as negotiated.
pub(crate) fn process(media: &mut MediaState, sdp: &Sdp, answer: bool, update: bool) -> bool {
    let mut changed = false;

    if let Some(conn) = &sdp.connection {
        set_remote_ip(media, &conn.address, &mut changed);
    }

    for section in &sdp.media {
        media.require_srtp =
            media.require_srtp || section.media.proto == TransportProtocol::RtpSavp;

        let kind = match section.media.kind {
            MediaKind::Audio => Kind::Audio,
            MediaKind::Video => Kind::Video,
            ref other => {
                log::warn!("unsupported media line ({other}), skipping");
                continue;
            }
        };

        if section.media.port != 0 {
            let line = media.line_mut(kind);

            if section.media.port != line.remote_rtp_port {
                changed = true;
            }

            line.active = true;
            line.remote_rtp_port = section.media.port;
            // RTCP is assumed to live on the next port
            line.remote_rtcp_port = section.media.port + 1;
            line.send = section.direction.peer_receives();
        } else {
            media.line_mut(kind).send = false;
        }

        if let Some(conn) = &section.connection {
            set_remote_ip(media, &conn.address, &mut changed);
        }

        if update {
            // a session update only moves IPs and ports
            continue;
        }

        ingest_crypto(media, kind, section);

        if answer {
            latch_payload_type(media, kind, section);
        }
    }

    changed
}

/// Resolve the session's textual remote address.
///
/// Runs on the request-handler task so the relay loop never blocks on
/// DNS. A failed resolution keeps whatever address was in effect.
pub(crate) async fn resolve_remote(session: &Session) {
    let Some(host) = session.media.lock().remote_ip.clone() else {
        return;
    };

    let addr = if let Ok(ip) = host.parse::<IpAddr>() {
        Some(ip)
    } else {
        match tokio::net::lookup_host((host.as_str(), 0u16)).await {
            Ok(addrs) => {
                let addrs: Vec<_> = addrs.map(|a| a.ip()).collect();
                addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied()
            }
            Err(e) => {
                log::error!("couldn't resolve remote address {host:?}: {e}");
                None
            }
        }
    };

    match addr {
        Some(addr) => session.media.lock().remote_addr = Some(addr),
        None => log::warn!("no usable address for {host:?}, keeping the previous one"),
    }
}

/// Reject descriptions the bridge cannot relay: nothing negotiated or no
/// address to send to.
pub(crate) fn check_negotiated(media: &MediaState) -> Result<(), PluginError> {
    if !media.audio.active && !media.video.active {
        return Err(PluginError::InvalidSdp(
            "no audio and no video being negotiated".into(),
        ));
    }

    if media.remote_ip.is_none() {
        return Err(PluginError::InvalidSdp("no remote IP address".into()));
    }

    Ok(())
}

fn set_remote_ip(media: &mut MediaState, address: &TaggedAddress, changed: &mut bool) {
    let host = address.host();

    if media.remote_ip.as_deref() != Some(host.as_str()) {
        if media.remote_ip.is_some() {
            *changed = true;
        }
        media.remote_ip = Some(host);
    }
}

/// First acceptable crypto attribute per kind wins, the rest are noted
/// and skipped.
fn ingest_crypto(media: &mut MediaState, kind: Kind, section: &MediaSection) {
    for attr in &section.crypto {
        let current = media.line(kind).srtp_suite_in;

        if current != 0 {
            log::warn!(
                "already have a {} SRTP context (SHA1_{current}), skipping additional crypto line",
                kind.as_str()
            );
            continue;
        }

        let Some(suite) = attr.suite.tag_len() else {
            log::warn!("unsupported crypto suite {}, ignoring", attr.suite);
            continue;
        };

        let Some(key) = attr.keys.first() else {
            log::warn!("crypto line without keying material, ignoring");
            continue;
        };

        match crypto::set_remote(media, kind, &key.key_and_salt, suite) {
            Ok(()) => media.has_srtp_remote = true,
            Err(e) => log::warn!("failed to install remote SRTP context: {e}"),
        }
    }
}

fn latch_payload_type(media: &mut MediaState, kind: Kind, section: &MediaSection) {
    let Some(pt) = section.first_pt() else {
        return;
    };

    let name = codec_name(section, pt);
    let line = media.line_mut(kind);
    line.pt = Some(pt);
    line.pt_name = name;
}

fn codec_name(section: &MediaSection, pt: u8) -> Option<String> {
    if let Some(name) = section.encoding_name(pt) {
        return Some(name.to_ascii_lowercase());
    }

    // static payload types won't carry an rtpmap
    let name = match pt {
        0 => "pcmu",
        3 => "gsm",
        8 => "pcma",
        9 => "g722",
        18 => "g729",
        26 => "jpeg",
        31 => "h261",
        32 => "mpv",
        34 => "h263",
        _ => return None,
    };

    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytesstr::BytesStr;
    use std::net::Ipv4Addr;

    fn test_config() -> Config {
        Config {
            local_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            rtp_range: (10000, 60000),
            events: false,
        }
    }

    fn parse(text: &str) -> Sdp {
        Sdp::parse(&BytesStr::from(text.to_owned())).unwrap()
    }

    const PEER_ANSWER: &str = "\
v=0\r\n\
o=- 1 1 IN IP4 203.0.113.9\r\n\
s=-\r\n\
c=IN IP4 203.0.113.9\r\n\
t=0 0\r\n\
m=audio 40000 RTP/SAVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR\r\n\
";

    const WEBRTC_OFFER: &str = "\
v=0\r\n\
o=- 651892631 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=mid:0\r\n\
";

    #[test]
    fn manipulate_offer_plain() {
        let config = test_config();
        let mut media = MediaState::default();
        media.audio.active = true;
        media.audio.local_rtp_port = 20000;

        let mut sdp = parse(WEBRTC_OFFER);
        let text = manipulate(&config, &mut media, &mut sdp, false);

        assert!(text.contains("m=audio 20000 RTP/AVP 111 0\r\n"));
        assert!(text.contains("c=IN IP4 192.0.2.10\r\n"));
        assert!(!text.contains("a=crypto"));
        // unmodeled attributes survive the rewrite
        assert!(text.contains("a=mid:0\r\n"));
    }

    #[test]
    fn manipulate_offer_srtp_mandatory() {
        let config = test_config();
        let mut media = MediaState::default();
        media.audio.active = true;
        media.audio.local_rtp_port = 20000;
        media.require_srtp = true;
        media.has_srtp_local = true;

        let mut sdp = parse(WEBRTC_OFFER);
        let text = manipulate(&config, &mut media, &mut sdp, false);

        assert!(text.contains("m=audio 20000 RTP/SAVP 111 0\r\n"));
        assert_eq!(
            text.matches("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:").count(),
            1
        );
        assert!(media.audio.srtp_out.is_some());
        assert_eq!(media.audio.srtp_suite_out, 80);
    }

    #[test]
    fn manipulate_answer_latches_payload_type() {
        let config = test_config();
        let mut media = MediaState::default();
        media.audio.active = true;
        media.audio.local_rtp_port = 20000;

        let mut sdp = parse(WEBRTC_OFFER);
        manipulate(&config, &mut media, &mut sdp, true);

        assert_eq!(media.audio.pt, Some(111));
        assert_eq!(media.audio.pt_name.as_deref(), Some("opus"));
    }

    #[test]
    fn process_answer_installs_remote_srtp() {
        let mut media = MediaState::default();

        let changed = process(&mut media, &parse(PEER_ANSWER), true, false);

        assert!(changed);
        assert!(media.audio.active);
        assert_eq!(media.remote_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(media.audio.remote_rtp_port, 40000);
        assert_eq!(media.audio.remote_rtcp_port, 40001);
        assert!(media.require_srtp);
        assert!(media.has_srtp_remote);
        assert_eq!(media.audio.srtp_suite_in, 80);
        assert_eq!(media.audio.pt, Some(0));
        assert_eq!(media.audio.pt_name.as_deref(), Some("pcmu"));
        assert!(media.audio.send);

        assert!(check_negotiated(&media).is_ok());
    }

    #[test]
    fn process_sendonly_clears_send_gate() {
        let sdp = PEER_ANSWER.replace("a=rtpmap:0 PCMU/8000", "a=sendonly");
        let mut media = MediaState::default();

        process(&mut media, &parse(&sdp), true, false);

        assert!(!media.audio.send);
    }

    #[test]
    fn process_media_level_connection_overrides() {
        let sdp = PEER_ANSWER.replace(
            "m=audio 40000 RTP/SAVP 0\r\n",
            "m=audio 40000 RTP/SAVP 0\r\nc=IN IP4 198.51.100.77\r\n",
        );
        let mut media = MediaState::default();

        process(&mut media, &parse(&sdp), true, false);

        assert_eq!(media.remote_ip.as_deref(), Some("198.51.100.77"));
    }

    #[test]
    fn update_reports_port_change_and_skips_attributes() {
        let mut media = MediaState::default();
        process(&mut media, &parse(PEER_ANSWER), true, false);

        let in_before = media.audio.srtp_suite_in;

        // same endpoint: no change
        let changed = process(&mut media, &parse(PEER_ANSWER), false, true);
        assert!(!changed);

        // moved RTP port: change, but crypto must not be reprocessed
        let moved = PEER_ANSWER.replace("m=audio 40000", "m=audio 40100");
        let changed = process(&mut media, &parse(&moved), false, true);

        assert!(changed);
        assert_eq!(media.audio.remote_rtp_port, 40100);
        assert_eq!(media.audio.srtp_suite_in, in_before);
    }

    #[test]
    fn zero_media_sections_rejected() {
        let sdp = "v=0\r\no=- 1 1 IN IP4 203.0.113.9\r\ns=-\r\nc=IN IP4 203.0.113.9\r\nt=0 0\r\n";
        let mut media = MediaState::default();

        process(&mut media, &parse(sdp), false, false);

        let err = check_negotiated(&media).unwrap_err();
        assert_eq!(err.code(), 447);
    }

    #[test]
    fn unknown_crypto_suite_skipped() {
        let sdp = PEER_ANSWER.replace("AES_CM_128_HMAC_SHA1_80", "AEAD_AES_256_GCM");
        let mut media = MediaState::default();

        process(&mut media, &parse(&sdp), true, false);

        assert!(!media.has_srtp_remote);
        assert!(media.audio.srtp_in.is_none());
    }

    #[tokio::test]
    async fn resolve_numeric_remote() {
        use crate::session::{Session, SessionHandle};

        let session = Session::new(SessionHandle(9));
        session.media.lock().remote_ip = Some("203.0.113.9".into());

        resolve_remote(&session).await;

        assert_eq!(
            session.media.lock().remote_addr,
            Some("203.0.113.9".parse().unwrap())
        );
    }
}
