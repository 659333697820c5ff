//! Plain SDP, the subset spoken by non-WebRTC RTP endpoints.
//!
//! This crate models the session descriptions the NoSIP bridge exchanges
//! with legacy peers: `v=`/`o=`/`s=`/`c=`/`t=`/`m=` lines, media-level
//! direction, `a=rtpmap` and the RFC 4568 `a=crypto` attribute. Everything
//! else is preserved verbatim as an unknown attribute so a rewritten
//! description round-trips attributes it does not understand.
//!
//! Parsing borrows from the source buffer ([`BytesStr`]), serialization
//! goes through [`std::fmt::Display`].

#![warn(unreachable_pub)]

mod address;
mod attributes;
mod crypto;
mod fields;
mod media;
mod session;

pub use address::TaggedAddress;
pub use attributes::{Direction, RtpMap, UnknownAttribute};
pub use crypto::{SrtpCrypto, SrtpKeyingMaterial, SrtpSuite};
pub use fields::{Connection, Origin, Time};
pub use media::{Media, MediaKind, TransportProtocol};
pub use session::{MediaSection, ParseSdpError, Sdp};

pub(crate) type IResult<I, O> = nom::IResult<I, O>;

pub(crate) fn not_whitespace(c: char) -> bool {
    !c.is_ascii_whitespace()
}

pub(crate) fn probe_host(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

pub(crate) fn probe_host6(c: char) -> bool {
    probe_host(c) || c == ':'
}
