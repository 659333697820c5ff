use crate::session::SessionHandle;
use serde_json::Value;

/// Callbacks into the host gateway.
///
/// The bridge performs no signalling and owns no WebRTC machinery; both are
/// the host's job. These are the entry points it consumes: replying to the
/// application, forwarding media up to the WebRTC side and tearing the peer
/// connection down.
///
/// Implementations must tolerate being called from the request-handler
/// task, the per-session relay task and the host's own ingress threads
/// concurrently.
pub trait Gateway: Send + Sync + 'static {
    /// Deliver a reply (or asynchronous event) for a transaction.
    fn push_event(
        &self,
        handle: SessionHandle,
        transaction: &str,
        event: &Value,
        jsep: Option<&Value>,
    );

    /// Fire-and-forget notification for external event handlers.
    fn notify_event(&self, handle: SessionHandle, event: Value);

    /// Forward an RTP packet to the WebRTC side.
    fn relay_rtp(&self, handle: SessionHandle, video: bool, buf: &[u8]);

    /// Forward an RTCP packet to the WebRTC side.
    fn relay_rtcp(&self, handle: SessionHandle, video: bool, buf: &[u8]);

    /// Ask the host to close the WebRTC peer connection.
    fn close_pc(&self, handle: SessionHandle);

    /// Whether any event handler is attached on the host side.
    fn events_is_enabled(&self) -> bool;
}
