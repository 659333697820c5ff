//! The per-session relay task.
//!
//! One task per session, started when an answer is accepted. It services
//! the peer→WebRTC direction only: up to four connected UDP sockets are
//! multiplexed together with the session's wake handle and a one second
//! tick that bounds how long teardown and endpoint updates can go
//! unnoticed.

use crate::recorder;
use crate::rtp::{RtpHeader, StrideEstimate, DEFAULT_AUDIO_STEP, DEFAULT_VIDEO_STEP};
use crate::session::{Kind, Session};
use crate::Gateway;
use srtp::Error as SrtpError;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const RECV_BUFFER: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Rtp,
    Rtcp,
}

/// The relay's own snapshot of the session's sockets and remote endpoint.
///
/// Refreshed whenever the request handler flags an update; everything
/// else in here is frozen for the lifetime of the negotiation.
struct RelayIo {
    remote_addr: Option<IpAddr>,
    audio_rtp: Option<Arc<UdpSocket>>,
    audio_rtcp: Option<Arc<UdpSocket>>,
    video_rtp: Option<Arc<UdpSocket>>,
    video_rtcp: Option<Arc<UdpSocket>>,
    audio_rtp_port: u16,
    audio_rtcp_port: u16,
    video_rtp_port: u16,
    video_rtcp_port: u16,
}

fn snapshot(session: &Session) -> RelayIo {
    let media = session.media.lock();

    RelayIo {
        remote_addr: media.remote_addr,
        audio_rtp: media.audio.rtp_socket.clone(),
        audio_rtcp: media.audio.rtcp_socket.clone(),
        video_rtp: media.video.rtp_socket.clone(),
        video_rtcp: media.video.rtcp_socket.clone(),
        audio_rtp_port: media.audio.remote_rtp_port,
        audio_rtcp_port: media.audio.remote_rtcp_port,
        video_rtp_port: media.video.remote_rtp_port,
        video_rtcp_port: media.video.remote_rtcp_port,
    }
}

/// Connect every open socket to its remote port. Connecting lets the
/// ingress shims use plain sends and makes the kernel surface ICMP
/// unreachables as socket errors.
async fn connect_sockets(session: &Session, io: &RelayIo) {
    let Some(addr) = io.remote_addr else {
        return;
    };

    let targets = [
        (&io.audio_rtp, io.audio_rtp_port, "audio RTP"),
        (&io.audio_rtcp, io.audio_rtcp_port, "audio RTCP"),
        (&io.video_rtp, io.video_rtp_port, "video RTP"),
        (&io.video_rtcp, io.video_rtcp_port, "video RTCP"),
    ];

    for (socket, port, label) in targets {
        let Some(socket) = socket else { continue };

        if port == 0 {
            continue;
        }

        if let Err(e) = socket.connect((addr, port)).await {
            log::error!(
                "[{}] couldn't connect {label} to {addr}:{port}: {e}",
                session.handle
            );
        }
    }
}

async fn recv_or_pending(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<Vec<u8>> {
    match socket {
        Some(socket) => {
            let len = socket.recv(buf).await?;
            Ok(buf[..len].to_vec())
        }
        None => std::future::pending().await,
    }
}

enum Input {
    Wake,
    Tick,
    Packet {
        kind: Kind,
        channel: Channel,
        result: io::Result<Vec<u8>>,
    },
}

pub(crate) async fn relay_loop(gateway: Arc<dyn Gateway>, session: Arc<Session>) {
    log::info!("[{}] starting relay loop", session.handle);

    let mut io = snapshot(&session);

    if io.remote_addr.is_none() {
        log::warn!("[{}] no remote address", session.handle);
    }

    connect_sockets(&session, &io).await;

    let mut audio_stride = StrideEstimate::default();
    let mut video_stride = StrideEstimate::default();

    let mut tick = tokio::time::interval(Duration::from_secs(1));

    let mut audio_rtp_buf = [0u8; RECV_BUFFER];
    let mut audio_rtcp_buf = [0u8; RECV_BUFFER];
    let mut video_rtp_buf = [0u8; RECV_BUFFER];
    let mut video_rtcp_buf = [0u8; RECV_BUFFER];

    loop {
        if session.is_destroyed() || session.is_hanging_up() {
            break;
        }

        let updated = {
            let mut media = session.media.lock();
            std::mem::take(&mut media.updated)
        };

        if updated {
            io = snapshot(&session);

            if io.remote_addr.is_some() {
                log::debug!("[{}] updating session sockets", session.handle);
                connect_sockets(&session, &io).await;
            } else {
                log::error!(
                    "[{}] couldn't update session: missing or invalid remote address",
                    session.handle
                );
            }
        }

        let input = tokio::select! {
            _ = session.wake.notified() => Input::Wake,
            _ = tick.tick() => Input::Tick,
            result = recv_or_pending(io.audio_rtp.as_deref(), &mut audio_rtp_buf) => Input::Packet {
                kind: Kind::Audio,
                channel: Channel::Rtp,
                result,
            },
            result = recv_or_pending(io.audio_rtcp.as_deref(), &mut audio_rtcp_buf) => Input::Packet {
                kind: Kind::Audio,
                channel: Channel::Rtcp,
                result,
            },
            result = recv_or_pending(io.video_rtp.as_deref(), &mut video_rtp_buf) => Input::Packet {
                kind: Kind::Video,
                channel: Channel::Rtp,
                result,
            },
            result = recv_or_pending(io.video_rtcp.as_deref(), &mut video_rtcp_buf) => Input::Packet {
                kind: Kind::Video,
                channel: Channel::Rtcp,
                result,
            },
        };

        let Input::Packet {
            kind,
            channel,
            result,
        } = input
        else {
            // wake or tick: re-check the termination flags and `updated`
            continue;
        };

        match result {
            Ok(packet) => match channel {
                Channel::Rtp => {
                    let stride = match kind {
                        Kind::Audio => &mut audio_stride,
                        Kind::Video => &mut video_stride,
                    };
                    handle_rtp(&gateway, &session, kind, packet, stride);
                }
                Channel::Rtcp => handle_rtcp(&gateway, &session, kind, packet),
            },
            Err(e) => {
                if session.media.lock().updated {
                    // the endpoint is being moved, let things calm down
                    continue;
                }

                if e.kind() == io::ErrorKind::ConnectionRefused && channel == Channel::Rtcp {
                    // the peer never opened its RTCP port
                    log::warn!(
                        "[{}] connection refused on the {} RTCP socket, closing it",
                        session.handle,
                        kind.as_str()
                    );

                    match kind {
                        Kind::Audio => io.audio_rtcp = None,
                        Kind::Video => io.video_rtcp = None,
                    }
                    session.media.lock().line_mut(kind).rtcp_socket = None;

                    continue;
                }

                log::error!(
                    "[{}] error on the {} {} socket: {e}",
                    session.handle,
                    kind.as_str(),
                    match channel {
                        Channel::Rtp => "RTP",
                        Channel::Rtcp => "RTCP",
                    }
                );

                gateway.close_pc(session.handle);
                break;
            }
        }
    }

    teardown(&session);
    session.release_relay();

    log::info!("[{}] leaving relay loop", session.handle);
}

fn handle_rtp(
    gateway: &Arc<dyn Gateway>,
    session: &Session,
    kind: Kind,
    mut packet: Vec<u8>,
    stride: &mut StrideEstimate,
) {
    let Some(header) = RtpHeader::parse(&packet) else {
        log::debug!("[{}] dropping malformed {} RTP packet", session.handle, kind.as_str());
        return;
    };

    {
        let mut media = session.media.lock();

        {
            let line = media.line_mut(kind);
            if line.ssrc_peer != header.ssrc {
                line.ssrc_peer = header.ssrc;
                log::debug!(
                    "[{}] got peer {} SSRC {}",
                    session.handle,
                    kind.as_str(),
                    header.ssrc
                );
            }
        }

        if media.has_srtp_remote {
            let line = media.line_mut(kind);
            let Some(srtp_in) = line.srtp_in.as_mut() else {
                return;
            };

            match srtp_in.unprotect(&mut packet) {
                Ok(()) => {}
                Err(SrtpError::ReplayFail | SrtpError::ReplayOld) => return,
                Err(e) => {
                    log::warn!(
                        "[{}] {} SRTP unprotect error: {e} (seq={}, ts={})",
                        session.handle,
                        kind.as_str(),
                        header.sequence_number,
                        header.timestamp
                    );
                    return;
                }
            }
        }

        let step = match kind {
            Kind::Audio => stride.step_or(DEFAULT_AUDIO_STEP),
            Kind::Video => stride.step_or(DEFAULT_VIDEO_STEP),
        };

        let (seq, ts) = media.line_mut(kind).context.update(&header, step);
        RtpHeader::patch(&mut packet, seq, ts);
    }

    stride.observe(header.timestamp);

    {
        let mut recorders = session.recorders.lock();
        let slot = match kind {
            Kind::Audio => &mut recorders.peer_audio,
            Kind::Video => &mut recorders.peer_video,
        };
        recorder::save_frame(slot, &packet);
    }

    gateway.relay_rtp(session.handle, kind.is_video(), &packet);
}

fn handle_rtcp(gateway: &Arc<dyn Gateway>, session: &Session, kind: Kind, mut packet: Vec<u8>) {
    {
        let mut media = session.media.lock();

        if media.has_srtp_remote {
            let Some(srtp_in) = media.line_mut(kind).srtp_in.as_mut() else {
                return;
            };

            match srtp_in.unprotect_rtcp(&mut packet) {
                Ok(()) => {}
                Err(SrtpError::ReplayFail | SrtpError::ReplayOld) => return,
                Err(e) => {
                    log::warn!(
                        "[{}] {} SRTCP unprotect error: {e}",
                        session.handle,
                        kind.as_str()
                    );
                    return;
                }
            }
        }
    }

    gateway.relay_rtcp(session.handle, kind.is_video(), &packet);
}

/// Close everything the loop owned and clear the local half of the media
/// state; the peer-facing fields survive for a possible renegotiation.
fn teardown(session: &Session) {
    let mut media = session.media.lock();

    for kind in [Kind::Audio, Kind::Video] {
        let line = media.line_mut(kind);
        line.rtp_socket = None;
        line.rtcp_socket = None;
        line.local_rtp_port = 0;
        line.local_rtcp_port = 0;
        line.ssrc = 0;
    }

    crate::crypto::cleanup(&mut media);
}
