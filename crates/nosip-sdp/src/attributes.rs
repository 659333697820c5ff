use crate::IResult;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, opt};
use nom::sequence::{preceded, tuple};
use std::fmt;
use std::str::FromStr;

/// Media direction attribute (`a=sendrecv` and friends)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    /// Whether the peer that sent this direction wants to receive media
    pub fn peer_receives(self) -> bool {
        !matches!(self, Direction::SendOnly | Direction::Inactive)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SendRecv => f.write_str("a=sendrecv"),
            Direction::SendOnly => f.write_str("a=sendonly"),
            Direction::RecvOnly => f.write_str("a=recvonly"),
            Direction::Inactive => f.write_str("a=inactive"),
        }
    }
}

/// Rtpmap attribute (`a=rtpmap`), payload number to encoding mapping
#[derive(Debug, Clone)]
pub struct RtpMap {
    pub payload: u8,
    pub encoding: BytesStr,
    pub clock_rate: u32,
    pub params: Option<BytesStr>,
}

impl RtpMap {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((
                map_res(digit1, FromStr::from_str),
                preceded(
                    tag(" "),
                    map(take_while(|c| c != '/'), |encoding| {
                        BytesStr::from_parse(src, encoding)
                    }),
                ),
                preceded(tag("/"), map_res(digit1, FromStr::from_str)),
                opt(preceded(tag("/"), |rem| {
                    Ok(("", BytesStr::from_parse(src, rem)))
                })),
            )),
            |(payload, encoding, clock_rate, params)| RtpMap {
                payload,
                encoding,
                clock_rate,
                params,
            },
        )(i)
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a=rtpmap:{} {}/{}",
            self.payload, self.encoding, self.clock_rate
        )?;

        if let Some(params) = &self.params {
            write!(f, "/{params}")?;
        }

        Ok(())
    }
}

/// Any attribute this crate does not model, kept as-is for round-tripping
#[derive(Debug, Clone)]
pub struct UnknownAttribute {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl fmt::Display for UnknownAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a={}", self.name)?;

        if let Some(value) = &self.value {
            write!(f, ":{value}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtpmap() {
        let input = BytesStr::from_static("111 opus/48000/2");

        let (rem, rtpmap) = RtpMap::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(rtpmap.payload, 111);
        assert_eq!(rtpmap.encoding, "opus");
        assert_eq!(rtpmap.clock_rate, 48000);
        assert_eq!(rtpmap.params.as_deref(), Some("2"));
        assert_eq!(rtpmap.to_string(), "a=rtpmap:111 opus/48000/2");
    }

    #[test]
    fn rtpmap_no_params() {
        let input = BytesStr::from_static("0 PCMU/8000");

        let (_, rtpmap) = RtpMap::parse(input.as_ref(), &input).unwrap();

        assert_eq!(rtpmap.payload, 0);
        assert_eq!(rtpmap.encoding, "PCMU");
        assert!(rtpmap.params.is_none());
    }

    #[test]
    fn direction_gate() {
        assert!(Direction::SendRecv.peer_receives());
        assert!(Direction::RecvOnly.peer_receives());
        assert!(!Direction::SendOnly.peer_receives());
        assert!(!Direction::Inactive.peer_receives());
    }
}
