//! SRTP context management for SDES keying.
//!
//! One outbound and one inbound `srtp::Session` per negotiated kind. The
//! outbound side always uses AES_CM_128_HMAC_SHA1_80 (we never offer the
//! short tag), the inbound side follows whatever acceptable suite the peer
//! put first in its crypto attribute.

use crate::session::{Kind, MediaLine, MediaState};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::RngCore;
use srtp::CryptoPolicy;

/// Master key plus salt for the AES_CM_128 suites.
pub(crate) const MASTER_LEN: usize = 30;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SrtpSetupError {
    #[error("failed to decode key: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("key material too short ({0} bytes)")]
    KeyTooShort(usize),
    #[error("failed to create SRTP context: {0}")]
    Srtp(srtp::Error),
}

/// Create the outbound context for `kind` with fresh keying material.
///
/// Returns the base64 key/salt to embed in the offered crypto attribute.
pub(crate) fn set_local(media: &mut MediaState, kind: Kind) -> Result<String, SrtpSetupError> {
    let mut key = vec![0u8; MASTER_LEN];
    rand::rng().fill_bytes(&mut key);

    let policy = CryptoPolicy::AES_CM_128_HMAC_SHA1_80;
    let outbound = srtp::Session::with_outbound_template(srtp::StreamPolicy {
        rtp: policy,
        rtcp: policy,
        key: &key,
        ..Default::default()
    })
    .map_err(SrtpSetupError::Srtp)?;

    let line = media.line_mut(kind);
    line.srtp_out = Some(outbound);
    line.srtp_suite_out = 80;

    log::debug!("{} outbound SRTP context created", kind.as_str());

    Ok(BASE64_STANDARD.encode(&key))
}

/// Install the peer's keying material as the inbound context for `kind`.
pub(crate) fn set_remote(
    media: &mut MediaState,
    kind: Kind,
    crypto_b64: &str,
    suite: u8,
) -> Result<(), SrtpSetupError> {
    let key = BASE64_STANDARD.decode(crypto_b64)?;

    if key.len() < MASTER_LEN {
        return Err(SrtpSetupError::KeyTooShort(key.len()));
    }

    let policy = match suite {
        32 => CryptoPolicy::AES_CM_128_HMAC_SHA1_32,
        _ => CryptoPolicy::AES_CM_128_HMAC_SHA1_80,
    };

    let inbound = srtp::Session::with_inbound_template(srtp::StreamPolicy {
        rtp: policy,
        rtcp: policy,
        key: &key,
        ..Default::default()
    })
    .map_err(SrtpSetupError::Srtp)?;

    let line = media.line_mut(kind);
    line.srtp_in = Some(inbound);
    line.srtp_suite_in = suite;

    log::debug!("{} inbound SRTP context created (SHA1_{suite})", kind.as_str());

    Ok(())
}

/// Drop every context and clear the keying flags. Safe on any state, any
/// number of times.
pub(crate) fn cleanup(media: &mut MediaState) {
    media.require_srtp = false;
    media.has_srtp_local = false;
    media.has_srtp_remote = false;

    for kind in [Kind::Audio, Kind::Video] {
        let line: &mut MediaLine = media.line_mut(kind);
        line.srtp_in = None;
        line.srtp_out = None;
        line.srtp_suite_in = 0;
        line.srtp_suite_out = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_key_roundtrips_through_base64() {
        let mut media = MediaState::default();

        let crypto = set_local(&mut media, Kind::Audio).unwrap();
        let key = BASE64_STANDARD.decode(&crypto).unwrap();

        assert_eq!(key.len(), MASTER_LEN);
        assert!(media.audio.srtp_out.is_some());
        assert_eq!(media.audio.srtp_suite_out, 80);
        assert!(media.video.srtp_out.is_none());
    }

    #[test]
    fn video_uses_its_own_suite_field() {
        let mut media = MediaState::default();

        set_local(&mut media, Kind::Video).unwrap();

        assert_eq!(media.video.srtp_suite_out, 80);
        assert_eq!(media.audio.srtp_suite_out, 0);
    }

    #[test]
    fn remote_rejects_short_keys() {
        let mut media = MediaState::default();
        let short = BASE64_STANDARD.encode([0u8; 10]);

        let err = set_remote(&mut media, Kind::Audio, &short, 80).unwrap_err();

        assert!(matches!(err, SrtpSetupError::KeyTooShort(10)));
        assert!(media.audio.srtp_in.is_none());
    }

    #[test]
    fn remote_installs_inbound_context() {
        let mut media = MediaState::default();
        let key = BASE64_STANDARD.encode([7u8; MASTER_LEN]);

        set_remote(&mut media, Kind::Audio, &key, 32).unwrap();

        assert!(media.audio.srtp_in.is_some());
        assert_eq!(media.audio.srtp_suite_in, 32);
    }

    #[test]
    fn protect_unprotect_roundtrip() {
        let mut sender = MediaState::default();
        let mut receiver = MediaState::default();

        let crypto = set_local(&mut sender, Kind::Audio).unwrap();
        set_remote(&mut receiver, Kind::Audio, &crypto, 80).unwrap();

        let mut packet = vec![0u8; 32];
        packet[0] = 0x80;
        packet[1] = 96;
        packet[3] = 1; // seq 1
        packet[11] = 9; // some ssrc
        for (i, byte) in packet.iter_mut().enumerate().skip(12) {
            *byte = i as u8;
        }
        let plain = packet.clone();

        sender
            .audio
            .srtp_out
            .as_mut()
            .unwrap()
            .protect(&mut packet)
            .unwrap();
        assert_ne!(packet, plain);
        assert!(packet.len() > plain.len());

        receiver
            .audio
            .srtp_in
            .as_mut()
            .unwrap()
            .unprotect(&mut packet)
            .unwrap();
        assert_eq!(packet, plain);
    }

    #[test]
    fn cleanup_resets_everything() {
        let mut media = MediaState::default();
        media.require_srtp = true;
        media.has_srtp_local = true;
        media.has_srtp_remote = true;
        set_local(&mut media, Kind::Audio).unwrap();

        cleanup(&mut media);

        assert!(!media.require_srtp);
        assert!(!media.has_srtp_local);
        assert!(!media.has_srtp_remote);
        assert!(media.audio.srtp_out.is_none());
        assert_eq!(media.audio.srtp_suite_out, 0);

        // idempotent
        cleanup(&mut media);
    }
}
