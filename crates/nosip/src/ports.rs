//! Local RTP/RTCP port allocation.
//!
//! RTP lives on a random even port within the configured range, RTCP on
//! the next odd port. The two are bound as a pair: if the RTCP bind
//! fails, the RTP socket is thrown away and the draw starts over. The
//! attempt budget is shared across both kinds.

use crate::config::Config;
use crate::error::PluginError;
use crate::session::{Kind, Session};
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

const ALLOCATE_ATTEMPTS: u32 = 100;

/// Bind sockets for every negotiated kind.
///
/// Re-entry is idempotent: sockets and ports from a previous `generate`
/// are dropped first. On failure every partially allocated socket is
/// released and the caller reports an IO error.
pub(crate) async fn allocate_local_ports(
    config: &Config,
    session: &Session,
) -> Result<(), PluginError> {
    let (need_audio, need_video) = {
        let mut media = session.media.lock();

        for kind in [Kind::Audio, Kind::Video] {
            let line = media.line_mut(kind);
            line.rtp_socket = None;
            line.rtcp_socket = None;
            line.local_rtp_port = 0;
            line.local_rtcp_port = 0;
            line.ssrc = 0;
        }

        (media.audio.active, media.video.active)
    };

    let mut attempts = ALLOCATE_ATTEMPTS;

    for kind in [Kind::Audio, Kind::Video] {
        let needed = match kind {
            Kind::Audio => need_audio,
            Kind::Video => need_video,
        };

        if !needed {
            continue;
        }

        let (rtp, rtcp, port) =
            bind_pair(config.local_ip, config.rtp_range, &mut attempts).await?;

        log::debug!(
            "{} RTP listener bound to {}:{port}, RTCP to {}",
            kind.as_str(),
            config.local_ip,
            port + 1
        );

        let mut media = session.media.lock();
        let line = media.line_mut(kind);
        line.rtp_socket = Some(rtp);
        line.rtcp_socket = Some(rtcp);
        line.local_rtp_port = port;
        line.local_rtcp_port = port + 1;
    }

    Ok(())
}

async fn bind_pair(
    ip: IpAddr,
    (range_min, range_max): (u16, u16),
    attempts: &mut u32,
) -> Result<(Arc<UdpSocket>, Arc<UdpSocket>, u16), PluginError> {
    loop {
        if *attempts == 0 {
            return Err(PluginError::Io("could not allocate RTP/RTCP ports"));
        }

        let mut port = rand::rng().random_range(range_min..=range_max);
        if port % 2 == 1 {
            // even port for RTP
            port = port.saturating_add(1);
        }
        if port > range_max || port == u16::MAX {
            port = range_max & !1;
        }
        if port < range_min {
            *attempts -= 1;
            continue;
        }

        let rtp = match UdpSocket::bind((ip, port)).await {
            Ok(socket) => socket,
            Err(e) => {
                log::debug!("bind failed for RTP port {port} ({e}), trying another one");
                *attempts -= 1;
                continue;
            }
        };

        let rtcp = match UdpSocket::bind((ip, port + 1)).await {
            Ok(socket) => socket,
            Err(e) => {
                log::debug!("bind failed for RTCP port {} ({e}), trying another one", port + 1);
                drop(rtp);
                *attempts -= 1;
                continue;
            }
        };

        return Ok((Arc::new(rtp), Arc::new(rtcp), port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use std::net::Ipv4Addr;

    fn test_config(range: (u16, u16)) -> Config {
        Config {
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtp_range: range,
            events: false,
        }
    }

    #[tokio::test]
    async fn allocates_adjacent_pair() {
        let session = Session::new(SessionHandle(1));
        session.media.lock().audio.active = true;

        allocate_local_ports(&test_config((30000, 40000)), &session)
            .await
            .unwrap();

        let media = session.media.lock();
        assert_eq!(media.audio.local_rtp_port % 2, 0);
        assert_eq!(media.audio.local_rtcp_port, media.audio.local_rtp_port + 1);
        assert!((30000..=40000).contains(&media.audio.local_rtp_port));
        assert!(media.audio.rtp_socket.is_some());
        assert!(media.audio.rtcp_socket.is_some());
        assert!(media.video.rtp_socket.is_none());
    }

    #[tokio::test]
    async fn both_kinds_get_distinct_pairs() {
        let session = Session::new(SessionHandle(2));
        {
            let mut media = session.media.lock();
            media.audio.active = true;
            media.video.active = true;
        }

        allocate_local_ports(&test_config((30000, 40000)), &session)
            .await
            .unwrap();

        let media = session.media.lock();
        assert_ne!(media.audio.local_rtp_port, media.video.local_rtp_port);
        assert!(media.video.rtp_socket.is_some());
    }

    #[tokio::test]
    async fn occupied_single_port_range_exhausts_attempts() {
        // park a socket on the only usable pair
        let blocker_rtp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = blocker_rtp.local_addr().unwrap().port() & !1;

        // rebind deterministically on the even port and its sibling
        drop(blocker_rtp);
        let _rtp = UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let _rtcp = UdpSocket::bind((Ipv4Addr::LOCALHOST, port + 1)).await.unwrap();

        let session = Session::new(SessionHandle(3));
        session.media.lock().audio.active = true;

        let err = allocate_local_ports(&test_config((port, port)), &session)
            .await
            .unwrap_err();

        assert_eq!(err.code(), 448);
    }

    #[tokio::test]
    async fn reentry_resets_previous_allocation() {
        let session = Session::new(SessionHandle(4));
        session.media.lock().audio.active = true;

        let config = test_config((30000, 40000));
        allocate_local_ports(&config, &session).await.unwrap();

        let first_port = session.media.lock().audio.local_rtp_port;

        allocate_local_ports(&config, &session).await.unwrap();

        let media = session.media.lock();
        assert!(media.audio.rtp_socket.is_some());
        assert_ne!(media.audio.local_rtp_port, 0);
        // old pair was released, the port may or may not repeat
        let _ = first_port;
    }
}
