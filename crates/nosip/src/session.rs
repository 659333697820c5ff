//! Per-session state and the process-wide session store.
//!
//! Destruction is two-phase: a destroyed session leaves the live map
//! immediately (no new work can be dispatched against it) but its storage
//! stays on the dead list for a grace period so the relay task and the
//! host's ingress threads can disengage. Sessions are reference counted,
//! so the grace period is a safety net rather than the thing keeping the
//! memory alive.

use crate::recorder::Recorders;
use crate::rtp::RtpSwitchingContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Opaque session identifier supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two media kinds the bridge relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Audio,
    Video,
}

impl Kind {
    pub(crate) fn from_video(video: bool) -> Kind {
        if video {
            Kind::Video
        } else {
            Kind::Audio
        }
    }

    pub(crate) fn is_video(self) -> bool {
        matches!(self, Kind::Video)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Kind::Audio => "audio",
            Kind::Video => "video",
        }
    }
}

/// Everything the bridge tracks for one negotiated kind.
pub(crate) struct MediaLine {
    /// Negotiated at all?
    pub(crate) active: bool,

    pub(crate) rtp_socket: Option<Arc<UdpSocket>>,
    pub(crate) rtcp_socket: Option<Arc<UdpSocket>>,

    pub(crate) local_rtp_port: u16,
    pub(crate) local_rtcp_port: u16,
    pub(crate) remote_rtp_port: u16,
    pub(crate) remote_rtcp_port: u16,

    /// SSRC we send towards the peer, latched from the first WebRTC packet
    pub(crate) ssrc: u32,
    /// SSRC the peer sends us, re-latched whenever it changes
    pub(crate) ssrc_peer: u32,

    pub(crate) pt: Option<u8>,
    pub(crate) pt_name: Option<String>,

    /// False when the peer declared sendonly/inactive
    pub(crate) send: bool,

    pub(crate) srtp_in: Option<srtp::Session>,
    pub(crate) srtp_out: Option<srtp::Session>,
    pub(crate) srtp_suite_in: u8,
    pub(crate) srtp_suite_out: u8,

    pub(crate) context: RtpSwitchingContext,
}

impl Default for MediaLine {
    fn default() -> Self {
        MediaLine {
            active: false,
            rtp_socket: None,
            rtcp_socket: None,
            local_rtp_port: 0,
            local_rtcp_port: 0,
            remote_rtp_port: 0,
            remote_rtcp_port: 0,
            ssrc: 0,
            ssrc_peer: 0,
            pt: None,
            pt_name: None,
            send: true,
            srtp_in: None,
            srtp_out: None,
            srtp_suite_in: 0,
            srtp_suite_out: 0,
            context: RtpSwitchingContext::default(),
        }
    }
}

#[derive(Default)]
pub(crate) struct MediaState {
    /// Peer address as it appeared in SDP
    pub(crate) remote_ip: Option<String>,
    /// Resolved peer address; resolution happens on the request-handler
    /// task so the relay never blocks on DNS
    pub(crate) remote_addr: Option<IpAddr>,

    /// An answer has been matched, the relay may run
    pub(crate) ready: bool,
    /// The remote endpoint moved, the relay must reconnect its sockets
    pub(crate) updated: bool,

    pub(crate) require_srtp: bool,
    pub(crate) has_srtp_local: bool,
    pub(crate) has_srtp_remote: bool,

    pub(crate) audio: MediaLine,
    pub(crate) video: MediaLine,
}

impl MediaState {
    pub(crate) fn line(&self, kind: Kind) -> &MediaLine {
        match kind {
            Kind::Audio => &self.audio,
            Kind::Video => &self.video,
        }
    }

    pub(crate) fn line_mut(&mut self, kind: Kind) -> &mut MediaLine {
        match kind {
            Kind::Audio => &mut self.audio,
            Kind::Video => &mut self.video,
        }
    }
}

pub struct Session {
    pub handle: SessionHandle,

    pub(crate) media: Mutex<MediaState>,

    /// The most recently accepted parsed SDP
    pub(crate) sdp: Mutex<Option<nosip_sdp::Sdp>>,

    pub(crate) recorders: Mutex<Recorders>,

    /// Wakes the relay loop out of its socket wait
    pub(crate) wake: Notify,

    /// Unix microseconds at destruction, zero while live
    destroyed_at: AtomicU64,
    hanging_up: AtomicBool,
    relay_running: AtomicBool,
}

impl Session {
    pub(crate) fn new(handle: SessionHandle) -> Arc<Session> {
        Arc::new(Session {
            handle,
            media: Mutex::new(MediaState::default()),
            sdp: Mutex::new(None),
            recorders: Mutex::new(Recorders::default()),
            wake: Notify::new(),
            destroyed_at: AtomicU64::new(0),
            hanging_up: AtomicBool::new(false),
            relay_running: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed_at.load(Ordering::Acquire) != 0
    }

    pub(crate) fn destroyed_at(&self) -> u64 {
        self.destroyed_at.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        let now_us = crate::recorder::unix_now() * 1_000_000;
        self.destroyed_at.store(now_us.max(1), Ordering::Release);
    }

    /// First caller wins, the rest observe an ongoing hangup.
    pub(crate) fn begin_hangup(&self) -> bool {
        !self.hanging_up.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_hanging_up(&self) -> bool {
        self.hanging_up.load(Ordering::Acquire)
    }

    pub(crate) fn clear_hangup(&self) {
        self.hanging_up.store(false, Ordering::Release);
    }

    /// Claim the single relay slot for this session.
    pub(crate) fn try_claim_relay(&self) -> bool {
        !self.relay_running.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_relay(&self) {
        self.relay_running.store(false, Ordering::Release);
    }
}

pub(crate) struct DeadSession {
    since: Instant,
    session: Arc<Session>,
}

/// Live map plus the deferred-reclamation list.
#[derive(Default)]
pub(crate) struct SessionMap {
    live: Mutex<HashMap<SessionHandle, Arc<Session>>>,
    dead: Mutex<Vec<DeadSession>>,
}

impl SessionMap {
    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.live.lock().insert(session.handle, session);
    }

    pub(crate) fn get(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.live.lock().get(&handle).cloned()
    }

    /// Two-phase destroy: out of the live map, onto the dead list.
    pub(crate) fn retire(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        let session = self.live.lock().remove(&handle)?;

        session.mark_destroyed();
        self.dead.lock().push(DeadSession {
            since: Instant::now(),
            session: Arc::clone(&session),
        });

        Some(session)
    }

    pub(crate) fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.live.lock().values().cloned().collect()
    }

    /// Drop dead sessions older than `grace`, releasing their SDP, remote
    /// address and SRTP state. Returns how many were reclaimed.
    pub(crate) fn reap(&self, grace: Duration) -> usize {
        let expired: Vec<DeadSession> = {
            let mut dead = self.dead.lock();
            let (expired, keep) = dead
                .drain(..)
                .partition(|entry| entry.since.elapsed() >= grace);
            *dead = keep;
            expired
        };

        let count = expired.len();

        for entry in expired {
            let session = entry.session;
            log::debug!("reaping session {}", session.handle);

            session.sdp.lock().take();

            let mut media = session.media.lock();
            media.remote_ip = None;
            media.remote_addr = None;
            crate::crypto::cleanup(&mut media);
        }

        count
    }
}
