use crate::{
    Connection, Direction, Media, MediaKind, Origin, RtpMap, SrtpCrypto, Time, UnknownAttribute,
};
use bytesstr::BytesStr;
use nom::Finish;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ParseSdpError {
    #[error("malformed line: {line:?}")]
    InvalidLine { line: String },
    #[error("description is missing the origin (o=) field")]
    MissingOrigin,
    #[error("description is missing the name (s=) field")]
    MissingName,
    #[error("description is missing the time (t=) field")]
    MissingTime,
}

/// One media section: the `m=` line plus everything up to the next one
#[derive(Debug, Clone)]
pub struct MediaSection {
    /// The `m=` line itself
    pub media: Media,

    /// Media-level connection, overrides the session `c=`
    pub connection: Option<Connection>,

    /// Media direction, inherited from the session level when absent
    pub direction: Direction,

    /// Payload mappings
    pub rtpmaps: Vec<RtpMap>,

    /// SDES crypto offers/answers
    pub crypto: Vec<SrtpCrypto>,

    /// Attributes kept verbatim
    pub attributes: Vec<UnknownAttribute>,
}

impl MediaSection {
    /// First payload type on the `m=` line, the negotiated codec on answers
    pub fn first_pt(&self) -> Option<u8> {
        self.media.fmts.first().copied()
    }

    /// Encoding name for a payload type, from the section's rtpmap if present
    pub fn encoding_name(&self, pt: u8) -> Option<&str> {
        self.rtpmaps
            .iter()
            .find(|r| r.payload == pt)
            .map(|r| r.encoding.as_ref())
    }
}

impl fmt::Display for MediaSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.media)?;

        if let Some(conn) = &self.connection {
            write!(f, "{conn}\r\n")?;
        }

        write!(f, "{}\r\n", self.direction)?;

        for rtpmap in &self.rtpmaps {
            write!(f, "{rtpmap}\r\n")?;
        }

        for crypto in &self.crypto {
            write!(f, "a=crypto:{crypto}\r\n")?;
        }

        for attr in &self.attributes {
            write!(f, "{attr}\r\n")?;
        }

        Ok(())
    }
}

/// A parsed plain session description
///
/// Serializes back to SDP through [`fmt::Display`], parses with
/// [`Sdp::parse`].
#[derive(Debug, Clone)]
pub struct Sdp {
    pub origin: Origin,
    pub name: BytesStr,
    pub connection: Option<Connection>,
    pub time: Time,
    pub direction: Direction,
    pub attributes: Vec<UnknownAttribute>,
    pub media: Vec<MediaSection>,
}

impl Sdp {
    pub fn parse(src: &BytesStr) -> Result<Self, ParseSdpError> {
        let mut parser = Parser::default();

        for line in src
            .split(|c| matches!(c, '\r' | '\n'))
            .filter(|line| !line.is_empty())
        {
            parser.parse_line(src, line)?;
        }

        parser.finish()
    }
}

impl fmt::Display for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n{}\r\ns={}\r\n", self.origin, self.name)?;

        if let Some(conn) = &self.connection {
            write!(f, "{conn}\r\n")?;
        }

        write!(f, "{}\r\n", self.time)?;

        for attr in &self.attributes {
            write!(f, "{attr}\r\n")?;
        }

        for section in &self.media {
            write!(f, "{section}")?;
        }

        Ok(())
    }
}

#[derive(Default)]
struct Parser {
    origin: Option<Origin>,
    name: Option<BytesStr>,
    connection: Option<Connection>,
    time: Option<Time>,
    direction: Direction,
    attributes: Vec<UnknownAttribute>,
    media: Vec<MediaSection>,
}

impl Parser {
    fn parse_line(&mut self, src: &BytesStr, line: &str) -> Result<(), ParseSdpError> {
        let invalid = || ParseSdpError::InvalidLine {
            line: line.to_string(),
        };

        let value = line.get(2..).ok_or_else(|| invalid())?;

        match line.as_bytes() {
            [b'v', b'=', b'0'] => {}
            [b'o', b'=', ..] => {
                let (_, origin) =
                    Origin::parse(src.as_ref(), value).finish().map_err(|_| invalid())?;
                self.origin = Some(origin);
            }
            [b's', b'=', ..] => {
                self.name = Some(BytesStr::from_parse(src.as_ref(), value));
            }
            [b't', b'=', ..] => {
                let (_, time) = Time::parse(value).finish().map_err(|_| invalid())?;
                self.time = Some(time);
            }
            [b'c', b'=', ..] => {
                let (_, conn) = Connection::parse(src.as_ref(), value)
                    .finish()
                    .map_err(|_| invalid())?;

                if let Some(section) = self.media.last_mut() {
                    section.connection = Some(conn);
                } else {
                    self.connection = Some(conn);
                }
            }
            [b'm', b'=', ..] => {
                let (_, media) =
                    Media::parse(src.as_ref(), value).finish().map_err(|_| invalid())?;

                self.media.push(MediaSection {
                    media,
                    connection: None,
                    // inherit the session-level direction
                    direction: self.direction,
                    rtpmaps: vec![],
                    crypto: vec![],
                    attributes: vec![],
                });
            }
            [b'a', b'=', ..] => self.parse_attribute(src, value),
            // b=, k=, z= and whatever else: tolerated and dropped
            _ => {}
        }

        Ok(())
    }

    fn parse_attribute(&mut self, src: &BytesStr, attr: &str) {
        if let Some((name, value)) = attr.split_once(':') {
            match name {
                "rtpmap" => {
                    if let (Some(section), Ok((_, rtpmap))) = (
                        self.media.last_mut(),
                        RtpMap::parse(src.as_ref(), value).finish(),
                    ) {
                        section.rtpmaps.push(rtpmap);
                        return;
                    }
                }
                "crypto" => {
                    if let (Some(section), Ok((_, crypto))) = (
                        self.media.last_mut(),
                        SrtpCrypto::parse(src.as_ref(), value).finish(),
                    ) {
                        section.crypto.push(crypto);
                        return;
                    }
                }
                _ => {}
            }

            self.push_unknown(UnknownAttribute {
                name: src.slice_ref(name),
                value: Some(src.slice_ref(value)),
            });
        } else {
            let direction = match attr {
                "sendrecv" => Some(Direction::SendRecv),
                "sendonly" => Some(Direction::SendOnly),
                "recvonly" => Some(Direction::RecvOnly),
                "inactive" => Some(Direction::Inactive),
                _ => None,
            };

            if let Some(direction) = direction {
                if let Some(section) = self.media.last_mut() {
                    section.direction = direction;
                } else {
                    self.direction = direction;
                }
            } else {
                self.push_unknown(UnknownAttribute {
                    name: src.slice_ref(attr),
                    value: None,
                });
            }
        }
    }

    fn push_unknown(&mut self, attr: UnknownAttribute) {
        if let Some(section) = self.media.last_mut() {
            section.attributes.push(attr);
        } else {
            self.attributes.push(attr);
        }
    }

    fn finish(self) -> Result<Sdp, ParseSdpError> {
        Ok(Sdp {
            origin: self.origin.ok_or(ParseSdpError::MissingOrigin)?,
            name: self.name.ok_or(ParseSdpError::MissingName)?,
            connection: self.connection,
            time: self.time.ok_or(ParseSdpError::MissingTime)?,
            direction: self.direction,
            attributes: self.attributes,
            media: self.media,
        })
    }
}
