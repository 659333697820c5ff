//! NoSIP media bridge.
//!
//! Relays RTP and RTCP between a WebRTC endpoint (mediated by a host
//! gateway) and a legacy peer speaking plain RTP/AVP or SDES-keyed
//! RTP/SAVP. The bridge performs no signalling: the application shuttles
//! SDP blobs across [`NosipPlugin::handle_message`], the bridge rewrites
//! them (`generate`), ingests the peer's side (`process`) and pumps media
//! between the gateway's callbacks and its own UDP sockets.
//!
//! [`NosipPlugin::init`] must be called from within a Tokio runtime: the
//! request handler, the session reaper and the per-session relay loops
//! all run as tasks on it.

#![warn(unreachable_pub)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

mod config;
mod crypto;
mod error;
mod gateway;
mod handler;
mod ports;
mod recorder;
mod relay;
mod rtcp;
mod rtp;
mod sdp;
mod session;

pub use config::Config;
pub use error::PluginError;
pub use gateway::Gateway;
pub use session::{Session, SessionHandle};

use handler::Message;
use session::{Kind, SessionMap};

pub const PLUGIN_VERSION: u32 = 1;
pub const PLUGIN_VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
pub const PLUGIN_NAME: &str = "NoSIP media bridge";
pub const PLUGIN_PACKAGE: &str = "nosip";

/// How long a destroyed session lingers before the reaper frees it.
const REAP_GRACE: Duration = Duration::from_secs(5);
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// One plugin instance. All state lives here, threaded by reference into
/// the tasks the instance spawns.
pub struct NosipPlugin {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) config: Config,
    pub(crate) sessions: SessionMap,

    tx: Mutex<Option<UnboundedSender<Message>>>,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NosipPlugin {
    /// Create the instance, read `nosip.cfg` from `config_dir` (missing
    /// file means defaults) and start the handler and reaper tasks.
    pub fn init(gateway: Arc<dyn Gateway>, config_dir: Option<&Path>) -> Arc<NosipPlugin> {
        ::srtp::ensure_init();

        let config = Config::load(config_dir);

        if !config.events && gateway.events_is_enabled() {
            log::warn!("notification of events to handlers disabled for {PLUGIN_NAME}");
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let plugin = Arc::new(NosipPlugin {
            gateway,
            config,
            sessions: SessionMap::default(),
            tx: Mutex::new(Some(tx)),
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let handler = tokio::spawn(Arc::clone(&plugin).message_loop(rx));
        let reaper = tokio::spawn(reaper_loop(Arc::clone(&plugin)));
        *plugin.tasks.lock() = vec![handler, reaper];

        log::info!("{PLUGIN_NAME} initialized");

        plugin
    }

    /// Stop the worker tasks and retire every live session.
    pub fn destroy(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        // closing the channel stops the handler once the queue drains
        self.tx.lock().take();

        for session in self.sessions.live_sessions() {
            self.hangup_media_for(&session);
            self.sessions.retire(session.handle);
            session.wake.notify_one();
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        log::info!("{PLUGIN_NAME} destroyed");
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Mirror an event towards the host's event handlers, when both the
    /// configuration and the host allow it.
    pub(crate) fn notify(&self, handle: SessionHandle, event: Value) {
        if self.config.events && self.gateway.events_is_enabled() {
            self.gateway.notify_event(handle, event);
        }
    }

    pub fn create_session(&self, handle: SessionHandle) -> Result<(), PluginError> {
        if self.is_stopping() {
            return Err(PluginError::WrongState("plugin is shutting down"));
        }

        log::debug!("creating session {handle}");
        self.sessions.insert(Session::new(handle));

        Ok(())
    }

    pub fn destroy_session(&self, handle: SessionHandle) -> Result<(), PluginError> {
        if self.is_stopping() {
            return Err(PluginError::WrongState("plugin is shutting down"));
        }

        let Some(session) = self.sessions.get(handle) else {
            log::error!("no session associated with handle {handle}");
            return Err(PluginError::WrongState("no such session"));
        };

        log::debug!("destroying session {handle}");
        self.hangup_media_for(&session);
        self.sessions.retire(handle);
        // the relay re-checks its flags on the next wake
        session.wake.notify_one();

        Ok(())
    }

    /// Generic introspection: keying state, active recordings, liveness.
    pub fn query_session(&self, handle: SessionHandle) -> Option<Value> {
        if self.is_stopping() {
            return None;
        }

        let session = self.sessions.get(handle)?;

        let mut info = json!({});

        if session.sdp.lock().is_some() {
            let media = session.media.lock();
            info["srtp-required"] = yes_no(media.require_srtp);
            info["sdes-local"] = yes_no(media.has_srtp_local);
            info["sdes-remote"] = yes_no(media.has_srtp_remote);
        }

        {
            let recorders = session.recorders.lock();
            if recorders.any_open() {
                let mut recording = json!({});
                if let Some(r) = &recorders.audio {
                    recording["audio"] = Value::from(r.filename.as_str());
                }
                if let Some(r) = &recorders.video {
                    recording["video"] = Value::from(r.filename.as_str());
                }
                if let Some(r) = &recorders.peer_audio {
                    recording["audio-peer"] = Value::from(r.filename.as_str());
                }
                if let Some(r) = &recorders.peer_video {
                    recording["video-peer"] = Value::from(r.filename.as_str());
                }
                info["recording"] = recording;
            }
        }

        info["destroyed"] = Value::from(session.destroyed_at());

        Some(info)
    }

    /// Enqueue a request; the reply is pushed asynchronously under the
    /// caller's transaction.
    pub fn handle_message(
        &self,
        handle: SessionHandle,
        transaction: impl Into<String>,
        message: Option<Value>,
        jsep: Option<Value>,
    ) -> Result<(), PluginError> {
        if self.is_stopping() {
            return Err(PluginError::WrongState("plugin is shutting down"));
        }

        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(PluginError::WrongState("plugin is shutting down"));
        };

        tx.send(Message {
            handle,
            transaction: transaction.into(),
            body: message,
            jsep,
        })
        .map_err(|_| PluginError::WrongState("plugin is shutting down"))
    }

    /// Host notification that the WebRTC media path is up.
    pub fn setup_media(&self, handle: SessionHandle) {
        log::info!("WebRTC media is now available on session {handle}");

        if self.is_stopping() {
            return;
        }

        let Some(session) = self.sessions.get(handle) else {
            log::error!("no session associated with handle {handle}");
            return;
        };

        if !session.is_destroyed() {
            session.clear_hangup();
        }
    }

    /// Host notification that the WebRTC media path is gone.
    pub fn hangup_media(&self, handle: SessionHandle) {
        if self.is_stopping() {
            return;
        }

        let Some(session) = self.sessions.get(handle) else {
            log::error!("no session associated with handle {handle}");
            return;
        };

        self.hangup_media_for(&session);
    }

    fn hangup_media_for(&self, session: &Session) {
        if session.is_destroyed() || !session.begin_hangup() {
            return;
        }

        log::info!("no WebRTC media anymore on session {}", session.handle);

        // tell the relay it's time to go
        session.wake.notify_one();

        session.recorders.lock().close_all();
    }

    /// RTP arriving from the WebRTC side, to be pushed towards the peer.
    ///
    /// Synchronous and called from the host's ingress threads; shares the
    /// session with the relay task only through the media lock, held for
    /// the duration of one packet.
    pub fn incoming_rtp(&self, handle: SessionHandle, video: bool, buf: &[u8]) {
        if self.is_stopping() {
            return;
        }

        let Some(session) = self.sessions.get(handle) else {
            log::error!("no session associated with handle {handle}");
            return;
        };

        if session.is_destroyed() {
            return;
        }

        let kind = Kind::from_video(video);
        let mut media = session.media.lock();

        // honour the peer's direction
        if !media.line(kind).send {
            return;
        }

        if media.line(kind).ssrc == 0 {
            if let Some(header) = rtp::RtpHeader::parse(buf) {
                media.line_mut(kind).ssrc = header.ssrc;
                log::debug!("[{handle}] got WebRTC {} SSRC {}", kind.as_str(), header.ssrc);
            }
        }

        let has_srtp_local = media.has_srtp_local;
        let line = media.line_mut(kind);

        if !line.active {
            return;
        }

        let Some(socket) = line.rtp_socket.clone() else {
            return;
        };

        if has_srtp_local {
            let Some(srtp_out) = line.srtp_out.as_mut() else {
                return;
            };

            // protect in an owned buffer, the tag grows the packet
            let mut packet = buf.to_vec();

            if let Err(e) = srtp_out.protect(&mut packet) {
                log::error!("[{handle}] {} SRTP protect error: {e}", kind.as_str());
                return;
            }

            drop(media);

            {
                let mut recorders = session.recorders.lock();
                let slot = match kind {
                    Kind::Audio => &mut recorders.audio,
                    Kind::Video => &mut recorders.video,
                };
                recorder::save_frame(slot, buf);
            }

            if let Err(e) = socket.try_send(&packet) {
                log::trace!("[{handle}] error sending {} SRTP packet: {e}", kind.as_str());
            }
        } else {
            drop(media);

            {
                let mut recorders = session.recorders.lock();
                let slot = match kind {
                    Kind::Audio => &mut recorders.audio,
                    Kind::Video => &mut recorders.video,
                };
                recorder::save_frame(slot, buf);
            }

            if let Err(e) = socket.try_send(buf) {
                log::trace!("[{handle}] error sending {} RTP packet: {e}", kind.as_str());
            }
        }
    }

    /// RTCP arriving from the WebRTC side. SSRCs are rewritten to the
    /// identifiers the peer knows before the packet goes out.
    pub fn incoming_rtcp(&self, handle: SessionHandle, video: bool, buf: &[u8]) {
        if self.is_stopping() {
            return;
        }

        let Some(session) = self.sessions.get(handle) else {
            log::error!("no session associated with handle {handle}");
            return;
        };

        if session.is_destroyed() {
            return;
        }

        let kind = Kind::from_video(video);
        let mut media = session.media.lock();
        let has_srtp_local = media.has_srtp_local;
        let line = media.line_mut(kind);

        if !line.active {
            return;
        }

        let Some(socket) = line.rtcp_socket.clone() else {
            return;
        };

        let mut packet = buf.to_vec();
        rtcp::fix_ssrcs(&mut packet, line.ssrc, line.ssrc_peer);

        if has_srtp_local {
            let Some(srtp_out) = line.srtp_out.as_mut() else {
                return;
            };

            if let Err(e) = srtp_out.protect_rtcp(&mut packet) {
                log::error!("[{handle}] {} SRTCP protect error: {e}", kind.as_str());
                return;
            }
        }

        drop(media);

        if let Err(e) = socket.try_send(&packet) {
            log::trace!("[{handle}] error sending {} RTCP packet: {e}", kind.as_str());
        }
    }
}

fn yes_no(value: bool) -> Value {
    Value::from(if value { "yes" } else { "no" })
}

async fn reaper_loop(plugin: Arc<NosipPlugin>) {
    log::debug!("reaper started");

    let mut tick = tokio::time::interval(REAP_INTERVAL);

    loop {
        tick.tick().await;

        if plugin.is_stopping() {
            break;
        }

        plugin.sessions.reap(REAP_GRACE);
    }

    log::debug!("reaper stopped");
}
