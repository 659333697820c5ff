//! The asynchronous request handler.
//!
//! `handle_message` only enqueues; a single task drains the FIFO, so
//! requests against a session are applied in submission order. Every
//! validation failure funnels into one reply join-point that emits the
//! error envelope.

use crate::error::PluginError;
use crate::ports;
use crate::recorder::{self, Recorder};
use crate::relay;
use crate::rtcp;
use crate::sdp;
use crate::session::{Session, SessionHandle};
use crate::{crypto, NosipPlugin};
use bytesstr::BytesStr;
use nosip_sdp::{MediaKind, Sdp};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub(crate) struct Message {
    pub(crate) handle: SessionHandle,
    pub(crate) transaction: String,
    pub(crate) body: Option<Value>,
    pub(crate) jsep: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    fn from_str(value: &str) -> Option<SdpType> {
        if value.eq_ignore_ascii_case("offer") {
            Some(SdpType::Offer)
        } else if value.eq_ignore_ascii_case("answer") {
            Some(SdpType::Answer)
        } else {
            None
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SrtpMode {
    SdesOptional,
    SdesMandatory,
}

impl SrtpMode {
    fn as_str(self) -> &'static str {
        match self {
            SrtpMode::SdesOptional => "sdes_optional",
            SrtpMode::SdesMandatory => "sdes_mandatory",
        }
    }
}

/// A validated request. Dispatch past this point is exhaustive, the
/// request string is matched exactly once.
enum Request {
    Generate {
        info: Option<String>,
        srtp: Option<SrtpMode>,
    },
    Process {
        sdp_type: String,
        sdp: String,
        info: Option<String>,
    },
    Hangup,
    Recording {
        action: String,
        audio: bool,
        video: bool,
        peer_audio: bool,
        peer_video: bool,
        filename: Option<String>,
    },
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, PluginError> {
    match obj.get(key) {
        None => Err(PluginError::MissingElement(key)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(PluginError::invalid_element(format!(
            "{key} should be a string"
        ))),
    }
}

fn optional_str<'a>(
    obj: &'a Map<String, Value>,
    key: &'static str,
) -> Result<Option<&'a str>, PluginError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(PluginError::invalid_element(format!(
            "{key} should be a string"
        ))),
    }
}

fn optional_bool(obj: &Map<String, Value>, key: &'static str) -> Result<bool, PluginError> {
    match obj.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(PluginError::invalid_element(format!(
            "{key} should be a boolean"
        ))),
    }
}

fn parse_request(body: &Value) -> Result<Request, PluginError> {
    let obj = body
        .as_object()
        .ok_or(PluginError::InvalidJson("not an object"))?;

    let request = required_str(obj, "request")?;

    match request.to_ascii_lowercase().as_str() {
        "generate" => {
            let info = optional_str(obj, "info")?.map(str::to_owned);
            let srtp = match optional_str(obj, "srtp")? {
                None => None,
                Some(mode) if mode.eq_ignore_ascii_case("sdes_optional") => {
                    Some(SrtpMode::SdesOptional)
                }
                Some(mode) if mode.eq_ignore_ascii_case("sdes_mandatory") => {
                    Some(SrtpMode::SdesMandatory)
                }
                Some(_) => {
                    return Err(PluginError::invalid_element(
                        "srtp can only be sdes_optional or sdes_mandatory",
                    ))
                }
            };

            Ok(Request::Generate { info, srtp })
        }
        "process" => {
            let sdp_type = required_str(obj, "type")?.to_owned();
            let sdp = required_str(obj, "sdp")?.to_owned();
            let info = optional_str(obj, "info")?.map(str::to_owned);
            // accepted for symmetry with generate, keying follows the SDP
            let _ = optional_str(obj, "srtp")?;

            Ok(Request::Process {
                sdp_type,
                sdp,
                info,
            })
        }
        "hangup" => Ok(Request::Hangup),
        "recording" => Ok(Request::Recording {
            action: required_str(obj, "action")?.to_owned(),
            audio: optional_bool(obj, "audio")?,
            video: optional_bool(obj, "video")?,
            peer_audio: optional_bool(obj, "peer_audio")?,
            peer_video: optional_bool(obj, "peer_video")?,
            filename: optional_str(obj, "filename")?.map(str::to_owned),
        }),
        _ => Err(PluginError::InvalidRequest(request.to_owned())),
    }
}

fn jsep_sdp(jsep: Option<&Value>) -> Result<(SdpType, &str), PluginError> {
    let jsep = jsep.ok_or(PluginError::MissingSdp("missing SDP"))?;

    let sdp = jsep
        .get("sdp")
        .and_then(Value::as_str)
        .ok_or(PluginError::MissingSdp("missing SDP"))?;

    let sdp_type = jsep
        .get("type")
        .and_then(Value::as_str)
        .and_then(SdpType::from_str)
        .ok_or(PluginError::MissingSdp("missing or invalid SDP type"))?;

    Ok((sdp_type, sdp))
}

impl NosipPlugin {
    pub(crate) async fn message_loop(self: Arc<Self>, mut rx: UnboundedReceiver<Message>) {
        log::debug!("joining handler loop");

        while let Some(msg) = rx.recv().await {
            let Some(session) = self.sessions.get(msg.handle) else {
                log::error!("no session associated with handle {}", msg.handle);
                continue;
            };

            if session.is_destroyed() {
                continue;
            }

            match self.handle_request(&session, &msg).await {
                Ok((result, jsep)) => {
                    let event = json!({ "nosip": "event", "result": result });
                    self.gateway
                        .push_event(msg.handle, &msg.transaction, &event, jsep.as_ref());
                }
                Err(e) => {
                    log::error!("request error on session {}: {e}", msg.handle);
                    let event = json!({
                        "nosip": "event",
                        "error_code": e.code(),
                        "error": e.to_string(),
                    });
                    self.gateway
                        .push_event(msg.handle, &msg.transaction, &event, None);
                }
            }
        }

        log::debug!("leaving handler loop");
    }

    async fn handle_request(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<(Value, Option<Value>), PluginError> {
        let body = msg.body.as_ref().ok_or(PluginError::NoMessage)?;

        match parse_request(body)? {
            Request::Generate { info, srtp } => {
                let (sdp_type, sdp_text) = jsep_sdp(msg.jsep.as_ref())?;
                let sdp_text = sdp_text.to_owned();
                self.sdp_exchange(session, true, sdp_type, &sdp_text, srtp, info)
                    .await
            }
            Request::Process {
                sdp_type,
                sdp,
                info,
            } => {
                let sdp_type = SdpType::from_str(&sdp_type)
                    .ok_or(PluginError::MissingSdp("missing or invalid SDP type"))?;
                self.sdp_exchange(session, false, sdp_type, &sdp, None, info)
                    .await
            }
            Request::Hangup => {
                self.gateway.close_pc(session.handle);
                Ok((json!({ "event": "hangingup" }), None))
            }
            Request::Recording {
                action,
                audio,
                video,
                peer_audio,
                peer_video,
                filename,
            } => self.recording(
                session,
                &action,
                [audio, video, peer_audio, peer_video],
                filename,
            ),
        }
    }

    /// Shared implementation of `generate` (rewrite a JSEP description
    /// into plain SDP) and `process` (ingest the peer's plain SDP).
    async fn sdp_exchange(
        &self,
        session: &Arc<Session>,
        generate: bool,
        sdp_type: SdpType,
        sdp_text: &str,
        srtp_mode: Option<SrtpMode>,
        info: Option<String>,
    ) -> Result<(Value, Option<Value>), PluginError> {
        let offer = sdp_type == SdpType::Offer;

        if sdp_text.contains("m=application") {
            return Err(PluginError::MissingSdp("data channels are not supported"));
        }

        if generate {
            let (do_srtp, require_srtp) = match srtp_mode {
                None => (false, false),
                Some(SrtpMode::SdesOptional) => (true, false),
                Some(SrtpMode::SdesMandatory) => (true, true),
            };

            let mut media = session.media.lock();

            if offer {
                // stale keying from a previous negotiation must not leak in
                crypto::cleanup(&mut media);
                media.require_srtp = require_srtp;
                media.has_srtp_local = do_srtp;

                if do_srtp {
                    log::debug!(
                        "going to negotiate SDES-SRTP ({})",
                        if require_srtp { "mandatory" } else { "optional" }
                    );
                }
            } else {
                // the answer must be consistent with the original offer
                let require_srtp = media.require_srtp || require_srtp;

                if require_srtp && !media.has_srtp_remote {
                    return Err(PluginError::TooStrict(
                        "can't generate answer: SDES-SRTP is required, but the peer didn't offer it",
                    ));
                }

                media.require_srtp = require_srtp;
                media.has_srtp_local = do_srtp || media.has_srtp_remote;
            }
        }

        let mut parsed = Sdp::parse(&BytesStr::from(sdp_text.to_owned()))
            .map_err(|e| PluginError::InvalidSdp(e.to_string()))?;

        let (result, jsep) = if generate {
            {
                let mut media = session.media.lock();

                for section in &parsed.media {
                    if section.media.port == 0 {
                        continue;
                    }

                    match section.media.kind {
                        MediaKind::Audio => media.audio.active = true,
                        MediaKind::Video => media.video.active = true,
                        _ => {}
                    }
                }
            }

            ports::allocate_local_ports(&self.config, session).await?;

            let sdp_out = {
                let mut media = session.media.lock();
                sdp::manipulate(&self.config, &mut media, &mut parsed, !offer)
            };

            *session.sdp.lock() = Some(parsed);
            session.clear_hangup();

            log::debug!(
                "prepared SDP {} for {}:\n{sdp_out}",
                sdp_type.as_str(),
                info.as_deref().unwrap_or("-")
            );

            self.notify(
                session.handle,
                json!({
                    "event": "generated",
                    "type": sdp_type.as_str(),
                    "sdp": sdp_out,
                }),
            );

            let result = json!({
                "event": "generated",
                "type": sdp_type.as_str(),
                "sdp": sdp_out,
            });

            (result, None)
        } else {
            // once the relay runs, a re-offer/re-answer is an endpoint
            // update: only IPs and ports may move
            let update = session.media.lock().ready;

            if offer && !update {
                crypto::cleanup(&mut session.media.lock());
            }

            let changed = {
                let mut media = session.media.lock();
                sdp::process(&mut media, &parsed, !offer, update)
            };

            sdp::check_negotiated(&session.media.lock())?;

            if !offer {
                let media = session.media.lock();
                if media.require_srtp && !media.has_srtp_remote {
                    return Err(PluginError::TooStrict(
                        "can't accept answer: SDES-SRTP is required, but the peer didn't offer it",
                    ));
                }
            }

            // resolve before the relay is told anything moved
            sdp::resolve_remote(session).await;

            if update && changed {
                session.media.lock().updated = true;
                session.wake.notify_one();
            }

            *session.sdp.lock() = Some(parsed);

            self.notify(
                session.handle,
                json!({
                    "event": "processed",
                    "type": sdp_type.as_str(),
                    "sdp": sdp_text,
                }),
            );

            let srtp_mode = {
                let media = session.media.lock();
                media.has_srtp_remote.then(|| {
                    if media.require_srtp {
                        SrtpMode::SdesMandatory
                    } else {
                        SrtpMode::SdesOptional
                    }
                })
            };

            let mut result = json!({
                "event": "processed",
                "type": sdp_type.as_str(),
                "sdp": sdp_text,
            });
            if let Some(mode) = srtp_mode {
                result["srtp"] = Value::from(mode.as_str());
            }

            let jsep = json!({ "type": sdp_type.as_str(), "sdp": sdp_text });

            (result, Some(jsep))
        };

        // an accepted answer is what arms the relay
        if !offer {
            session.media.lock().ready = true;
            self.start_relay(session);
        }

        Ok((result, jsep))
    }

    pub(crate) fn start_relay(&self, session: &Arc<Session>) {
        if session.try_claim_relay() {
            tokio::spawn(relay::relay_loop(
                Arc::clone(&self.gateway),
                Arc::clone(session),
            ));
        }
    }

    fn recording(
        &self,
        session: &Arc<Session>,
        action: &str,
        [audio, video, peer_audio, peer_video]: [bool; 4],
        filename: Option<String>,
    ) -> Result<(Value, Option<Value>), PluginError> {
        let start = if action.eq_ignore_ascii_case("start") {
            true
        } else if action.eq_ignore_ascii_case("stop") {
            false
        } else {
            return Err(PluginError::invalid_element(
                "invalid action (should be start|stop)",
            ));
        };

        if !(audio || video || peer_audio || peer_video) {
            return Err(PluginError::Recording(
                "at least one of audio, video, peer_audio and peer_video should be true",
            ));
        }

        let (audio_codec, video_codec) = {
            let media = session.media.lock();
            (media.audio.pt_name.clone(), media.video.pt_name.clone())
        };

        let now = recorder::unix_now();
        let base = |role: &str, kind: &str| match &filename {
            Some(base) => format!("{base}-{role}-{kind}"),
            None => format!("nosip-{}-{now}-{role}-{kind}", session.handle),
        };

        let mut recorders = session.recorders.lock();

        if start {
            if peer_audio {
                open_recorder(
                    &mut recorders.peer_audio,
                    audio_codec.as_deref(),
                    false,
                    base("peer", "audio"),
                );
            }
            if peer_video {
                open_recorder(
                    &mut recorders.peer_video,
                    video_codec.as_deref(),
                    true,
                    base("peer", "video"),
                );
            }
            if audio {
                open_recorder(
                    &mut recorders.audio,
                    audio_codec.as_deref(),
                    false,
                    base("user", "audio"),
                );
            }
            if video {
                open_recorder(
                    &mut recorders.video,
                    video_codec.as_deref(),
                    true,
                    base("user", "video"),
                );

                // ask the WebRTC side for a keyframe so the recording
                // doesn't open on undecodable deltas
                log::debug!("recording video, sending a PLI to kickstart it");
                self.gateway.relay_rtcp(session.handle, true, &rtcp::pli());
            }
        } else {
            // stopping something that never recorded is not an error
            if audio {
                if let Some(recorder) = recorders.audio.take() {
                    recorder.close();
                }
            }
            if video {
                if let Some(recorder) = recorders.video.take() {
                    recorder.close();
                }
            }
            if peer_audio {
                if let Some(recorder) = recorders.peer_audio.take() {
                    recorder.close();
                }
            }
            if peer_video {
                if let Some(recorder) = recorders.peer_video.take() {
                    recorder.close();
                }
            }
        }

        Ok((json!({ "event": "recordingupdated" }), None))
    }
}

fn open_recorder(slot: &mut Option<Recorder>, codec: Option<&str>, video: bool, base: String) {
    match Recorder::create(codec, video, &base) {
        Ok(recorder) => *slot = Some(recorder),
        Err(e) => log::error!("couldn't open recording {base}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_request_rejected() {
        let err = parse_request(&json!({ "request": "register" })).unwrap_err();
        assert_eq!(err.code(), 442);
    }

    #[test]
    fn missing_request_element() {
        let err = parse_request(&json!({})).unwrap_err();
        assert_eq!(err.code(), 443);
    }

    #[test]
    fn non_object_body() {
        let err = parse_request(&json!(42)).unwrap_err();
        assert_eq!(err.code(), 441);
    }

    #[test]
    fn bad_srtp_mode() {
        let err =
            parse_request(&json!({ "request": "generate", "srtp": "dtls" })).unwrap_err();
        assert_eq!(err.code(), 444);
    }

    #[test]
    fn process_requires_type_and_sdp() {
        let err = parse_request(&json!({ "request": "process", "sdp": "v=0" })).unwrap_err();
        assert_eq!(err.code(), 443);

        let err = parse_request(&json!({ "request": "process", "type": 3, "sdp": "v=0" }))
            .unwrap_err();
        assert_eq!(err.code(), 444);
    }

    #[test]
    fn request_matching_is_case_insensitive() {
        assert!(matches!(
            parse_request(&json!({ "request": "HANGUP" })),
            Ok(Request::Hangup)
        ));
    }

    #[test]
    fn recording_booleans_validated() {
        let err = parse_request(&json!({
            "request": "recording",
            "action": "start",
            "audio": "yes",
        }))
        .unwrap_err();
        assert_eq!(err.code(), 444);
    }

    #[test]
    fn jsep_extraction() {
        assert_eq!(jsep_sdp(None).unwrap_err().code(), 446);

        let err = jsep_sdp(Some(&json!({ "type": "offer" }))).unwrap_err();
        assert_eq!(err.code(), 446);

        let err = jsep_sdp(Some(&json!({ "type": "pranswer", "sdp": "v=0" }))).unwrap_err();
        assert_eq!(err.code(), 446);

        let (sdp_type, sdp) = jsep_sdp(Some(&json!({ "type": "offer", "sdp": "v=0" }))).unwrap();
        assert_eq!(sdp_type, SdpType::Offer);
        assert_eq!(sdp, "v=0");
    }
}
