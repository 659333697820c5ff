use crate::{not_whitespace, IResult};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{digit1, space1};
use nom::combinator::{map, map_res, opt};
use nom::multi::many0;
use nom::sequence::{preceded, tuple};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
    Other(BytesStr),
}

impl MediaKind {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            alt((
                map(tag("audio"), |_| MediaKind::Audio),
                map(tag("video"), |_| MediaKind::Video),
                map(tag("application"), |_| MediaKind::Application),
                map(take_while1(not_whitespace), |kind| {
                    MediaKind::Other(BytesStr::from_parse(src, kind))
                }),
            ))(i)
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
            MediaKind::Application => f.write_str("application"),
            MediaKind::Other(kind) => f.write_str(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportProtocol {
    /// Plain RTP over UDP
    RtpAvp,

    /// SDES-keyed SRTP over UDP
    RtpSavp,

    Other(BytesStr),
}

impl TransportProtocol {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        // match on the whole token, RTP/SAVPF must not parse as RTP/SAVP
        move |i| {
            map(take_while1(not_whitespace), |proto| match proto {
                "RTP/AVP" => TransportProtocol::RtpAvp,
                "RTP/SAVP" => TransportProtocol::RtpSavp,
                other => TransportProtocol::Other(BytesStr::from_parse(src, other)),
            })(i)
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::RtpAvp => f.write_str("RTP/AVP"),
            TransportProtocol::RtpSavp => f.write_str("RTP/SAVP"),
            TransportProtocol::Other(proto) => f.write_str(proto),
        }
    }
}

/// Media field (`m=`)
#[derive(Debug, Clone)]
pub struct Media {
    pub kind: MediaKind,
    pub port: u16,
    pub ports_num: Option<u32>,
    pub proto: TransportProtocol,
    pub fmts: Vec<u8>,
}

impl Media {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((
                MediaKind::parse(src),
                preceded(space1, map_res(digit1, FromStr::from_str)),
                opt(preceded(tag("/"), map_res(digit1, FromStr::from_str))),
                preceded(space1, TransportProtocol::parse(src)),
                many0(preceded(space1, map_res(digit1, FromStr::from_str))),
            )),
            |(kind, port, ports_num, proto, fmts)| Media {
                kind,
                port,
                ports_num,
                proto,
                fmts,
            },
        )(i)
    }
}

impl fmt::Display for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {}", self.kind, self.port)?;

        if let Some(ports_num) = self.ports_num {
            write!(f, "/{ports_num}")?;
        }

        write!(f, " {}", self.proto)?;

        for fmt_ in &self.fmts {
            write!(f, " {fmt_}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_audio() {
        let input = BytesStr::from_static("audio 49170 RTP/AVP 0 8 96");

        let (rem, media) = Media::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(media.kind, MediaKind::Audio);
        assert_eq!(media.port, 49170);
        assert_eq!(media.proto, TransportProtocol::RtpAvp);
        assert_eq!(media.fmts, [0, 8, 96]);
        assert_eq!(media.to_string(), "m=audio 49170 RTP/AVP 0 8 96");
    }

    #[test]
    fn media_savp() {
        let input = BytesStr::from_static("video 0 RTP/SAVP 97");

        let (_, media) = Media::parse(input.as_ref(), &input).unwrap();

        assert_eq!(media.kind, MediaKind::Video);
        assert_eq!(media.port, 0);
        assert_eq!(media.proto, TransportProtocol::RtpSavp);
    }

    #[test]
    fn media_unknown_proto_roundtrip() {
        let input = BytesStr::from_static("audio 5004 udptl");

        let (_, media) = Media::parse(input.as_ref(), &input).unwrap();

        assert!(matches!(media.proto, TransportProtocol::Other(ref p) if p == "udptl"));
        assert_eq!(media.to_string(), "m=audio 5004 udptl");
    }
}
