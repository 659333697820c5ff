use crate::{probe_host, probe_host6, IResult};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::combinator::map;
use nom::sequence::preceded;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address with its SDP network/address-type tag (`IN IP4 ...` / `IN IP6 ...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedAddress {
    IP4(Ipv4Addr),
    IP4FQDN(BytesStr),

    IP6(Ipv6Addr),
    IP6FQDN(BytesStr),
}

impl From<IpAddr> for TaggedAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(ip) => Self::IP4(ip),
            IpAddr::V6(ip) => Self::IP6(ip),
        }
    }
}

impl TaggedAddress {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            alt((
                preceded(
                    tag("IN IP4 "),
                    map(take_while(probe_host), |host: &str| {
                        if let Ok(addr) = host.parse() {
                            TaggedAddress::IP4(addr)
                        } else {
                            TaggedAddress::IP4FQDN(BytesStr::from_parse(src, host))
                        }
                    }),
                ),
                preceded(
                    tag("IN IP6 "),
                    map(take_while(probe_host6), |host: &str| {
                        if let Ok(addr) = host.parse() {
                            TaggedAddress::IP6(addr)
                        } else {
                            TaggedAddress::IP6FQDN(BytesStr::from_parse(src, host))
                        }
                    }),
                ),
            ))(i)
        }
    }

    /// The bare address or hostname, without the `IN IPx` tag
    pub fn host(&self) -> String {
        match self {
            TaggedAddress::IP4(addr) => addr.to_string(),
            TaggedAddress::IP4FQDN(fqdn) => fqdn.to_string(),
            TaggedAddress::IP6(addr) => addr.to_string(),
            TaggedAddress::IP6FQDN(fqdn) => fqdn.to_string(),
        }
    }
}

impl fmt::Display for TaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggedAddress::IP4(addr) => write!(f, "IN IP4 {addr}"),
            TaggedAddress::IP4FQDN(fqdn) => write!(f, "IN IP4 {fqdn}"),
            TaggedAddress::IP6(addr) => write!(f, "IN IP6 {addr}"),
            TaggedAddress::IP6FQDN(fqdn) => write!(f, "IN IP6 {fqdn}"),
        }
    }
}
