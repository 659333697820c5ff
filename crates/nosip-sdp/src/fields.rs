use crate::{not_whitespace, IResult, TaggedAddress};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, digit1, space1};
use nom::combinator::{map, map_res};
use nom::multi::many0;
use nom::sequence::{preceded, terminated, tuple};
use std::fmt;
use std::str::FromStr;

/// Origin field (`o=`)
#[derive(Debug, Clone)]
pub struct Origin {
    pub username: BytesStr,
    pub session_id: BytesStr,
    pub session_version: BytesStr,
    pub address: TaggedAddress,
}

impl Origin {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((
                terminated(take_while1(not_whitespace), space1),
                terminated(take_while1(not_whitespace), space1),
                terminated(take_while1(not_whitespace), space1),
                TaggedAddress::parse(src),
            )),
            |(username, session_id, session_version, address)| Origin {
                username: BytesStr::from_parse(src, username),
                session_id: BytesStr::from_parse(src, session_id),
                session_version: BytesStr::from_parse(src, session_version),
                address,
            },
        )(i)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "o={} {} {} {}",
            self.username, self.session_id, self.session_version, self.address
        )
    }
}

/// Time field (`t=`)
#[derive(Debug, Clone, Copy, Default)]
pub struct Time {
    pub start: u64,
    pub stop: u64,
}

impl Time {
    pub fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                map_res(digit1, FromStr::from_str),
                preceded(space1, map_res(digit1, FromStr::from_str)),
            )),
            |(start, stop)| Time { start, stop },
        )(i)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={} {}", self.start, self.stop)
    }
}

/// Connection field (`c=`)
///
/// The optional multicast TTL/count suffix is parsed but not retained,
/// the bridge only ever cares about the unicast address.
#[derive(Debug, Clone)]
pub struct Connection {
    pub address: TaggedAddress,
}

impl Connection {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            terminated(
                TaggedAddress::parse(src),
                many0(preceded(char('/'), digit1)),
            ),
            |address| Connection { address },
        )(i)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c={}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn origin() {
        let input = BytesStr::from_static("- 651892631 651892631 IN IP4 198.51.100.7");

        let (rem, origin) = Origin::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(origin.username, "-");
        assert_eq!(origin.session_id, "651892631");
        assert_eq!(
            origin.to_string(),
            "o=- 651892631 651892631 IN IP4 198.51.100.7"
        );
    }

    #[test]
    fn time() {
        let (rem, time) = Time::parse("0 0").unwrap();

        assert!(rem.is_empty());
        assert_eq!(time.start, 0);
        assert_eq!(time.stop, 0);
        assert_eq!(time.to_string(), "t=0 0");
    }

    #[test]
    fn connection() {
        let input = BytesStr::from_static("IN IP4 203.0.113.9");

        let (rem, conn) = Connection::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(
            conn.address,
            TaggedAddress::IP4(Ipv4Addr::new(203, 0, 113, 9))
        );
        assert_eq!(conn.to_string(), "c=IN IP4 203.0.113.9");
    }

    #[test]
    fn connection_multicast_ttl_dropped() {
        let input = BytesStr::from_static("IN IP4 233.252.0.1/127/3");

        let (rem, conn) = Connection::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(conn.address.host(), "233.252.0.1");
    }
}
