use crate::{IResult, not_whitespace};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, not, opt, peek};
use nom::multi::{many0, separated_list1};
use nom::sequence::{preceded, separated_pair, terminated, tuple};
use std::fmt;
use std::str::FromStr;

/// Crypto attribute for SDES-keyed SRTP (`a=crypto`)
///
/// [RFC4568](https://www.rfc-editor.org/rfc/rfc4568)
#[derive(Debug, Clone)]
pub struct SrtpCrypto {
    /// Unique identifier within a media description
    pub tag: u32,

    /// Encryption and authentication algorithm
    pub suite: SrtpSuite,

    /// One or more `inline:` keys
    pub keys: Vec<SrtpKeyingMaterial>,

    /// Session parameters, kept verbatim
    pub params: Vec<BytesStr>,
}

impl SrtpCrypto {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((
                number,
                preceded(tag(" "), SrtpSuite::parse(src)),
                preceded(
                    tag(" "),
                    separated_list1(
                        char(';'),
                        preceded(tag("inline:"), SrtpKeyingMaterial::parse(src)),
                    ),
                ),
                many0(preceded(
                    take_while1(char::is_whitespace),
                    map(take_while1(not_whitespace), |p| {
                        BytesStr::from_parse(src, p)
                    }),
                )),
            )),
            |(tag, suite, keys, params)| Self {
                tag,
                suite,
                keys,
                params,
            },
        )(i)
    }
}

impl fmt::Display for SrtpCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tag, self.suite)?;

        let mut keys = self.keys.iter();

        if let Some(key) = keys.next() {
            write!(f, " inline:{key}")?;
        }

        for key in keys {
            write!(f, ";inline:{key}")?;
        }

        for param in &self.params {
            write!(f, " {param}")?;
        }

        Ok(())
    }
}

/// The crypto suites the bridge can negotiate, everything else is opaque
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum SrtpSuite {
    AES_CM_128_HMAC_SHA1_80,
    AES_CM_128_HMAC_SHA1_32,
    Ext(BytesStr),
}

impl SrtpSuite {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                |suite| match suite {
                    "AES_CM_128_HMAC_SHA1_80" => Self::AES_CM_128_HMAC_SHA1_80,
                    "AES_CM_128_HMAC_SHA1_32" => Self::AES_CM_128_HMAC_SHA1_32,
                    other => Self::Ext(BytesStr::from_parse(src, other)),
                },
            )(i)
        }
    }

    /// Authentication tag length in bits, for the suites the bridge knows
    pub fn tag_len(&self) -> Option<u8> {
        match self {
            SrtpSuite::AES_CM_128_HMAC_SHA1_80 => Some(80),
            SrtpSuite::AES_CM_128_HMAC_SHA1_32 => Some(32),
            SrtpSuite::Ext(_) => None,
        }
    }
}

impl fmt::Display for SrtpSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SrtpSuite::AES_CM_128_HMAC_SHA1_80 => f.write_str("AES_CM_128_HMAC_SHA1_80"),
            SrtpSuite::AES_CM_128_HMAC_SHA1_32 => f.write_str("AES_CM_128_HMAC_SHA1_32"),
            SrtpSuite::Ext(ext) => f.write_str(ext),
        }
    }
}

/// A single `inline:` key of a crypto attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    /// Concatenated master key and salt, base64 encoded
    pub key_and_salt: BytesStr,

    /// Master key lifetime
    pub lifetime: Option<BytesStr>,

    /// Master key index and MKI field length
    pub mki: Option<(u32, u32)>,
}

impl SrtpKeyingMaterial {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                tuple((
                    take_while1(is_base64_char),
                    // lookahead keeps a `|mki:len` suffix from parsing as lifetime
                    opt(terminated(
                        preceded(
                            char('|'),
                            map(
                                take_while1(|c: char| c.is_ascii_digit() || c == '^'),
                                |lt| BytesStr::from_parse(src, lt),
                            ),
                        ),
                        peek(not(char(':'))),
                    )),
                    opt(preceded(
                        char('|'),
                        separated_pair(number, char(':'), number),
                    )),
                )),
                |(key_and_salt, lifetime, mki)| Self {
                    key_and_salt: BytesStr::from_parse(src, key_and_salt),
                    lifetime,
                    mki,
                },
            )(i)
        }
    }
}

impl fmt::Display for SrtpKeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_and_salt)?;

        if let Some(lifetime) = &self.lifetime {
            write!(f, "|{lifetime}")?;
        }

        if let Some((mki, mki_len)) = self.mki {
            write!(f, "|{mki}:{mki_len}")?;
        }

        Ok(())
    }
}

fn is_base64_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')
}

fn number(i: &str) -> IResult<&str, u32> {
    map_res(digit1, FromStr::from_str)(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR";

    #[test]
    fn crypto_sha1_80() {
        let i = BytesStr::from_static("1 AES_CM_128_HMAC_SHA1_80 inline:PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR");
        let (rem, c) = SrtpCrypto::parse(i.as_ref(), &i).unwrap();

        assert!(rem.is_empty(), "rem is not empty: {rem:?}");
        assert_eq!(c.tag, 1);
        assert_eq!(c.suite, SrtpSuite::AES_CM_128_HMAC_SHA1_80);
        assert_eq!(c.keys.len(), 1);
        assert_eq!(c.keys[0].key_and_salt, KEY);
        assert_eq!(
            c.to_string(),
            format!("1 AES_CM_128_HMAC_SHA1_80 inline:{KEY}")
        );
    }

    #[test]
    fn crypto_with_lifetime_and_mki() {
        let i = BytesStr::from_static(
            "2 AES_CM_128_HMAC_SHA1_32 inline:PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR|2^20|1:4",
        );
        let (rem, c) = SrtpCrypto::parse(i.as_ref(), &i).unwrap();

        assert!(rem.is_empty(), "rem is not empty: {rem:?}");
        assert_eq!(c.suite, SrtpSuite::AES_CM_128_HMAC_SHA1_32);
        assert_eq!(c.keys[0].lifetime.as_deref(), Some("2^20"));
        assert_eq!(c.keys[0].mki, Some((1, 4)));
        assert_eq!(
            c.to_string(),
            format!("2 AES_CM_128_HMAC_SHA1_32 inline:{KEY}|2^20|1:4")
        );
    }

    #[test]
    fn crypto_unknown_suite() {
        let i = BytesStr::from_static("1 AEAD_AES_256_GCM inline:PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR");
        let (_, c) = SrtpCrypto::parse(i.as_ref(), &i).unwrap();

        assert!(matches!(c.suite, SrtpSuite::Ext(ref s) if s == "AEAD_AES_256_GCM"));
        assert_eq!(c.suite.tag_len(), None);
    }

    #[test]
    fn crypto_session_params_kept() {
        let i = BytesStr::from_static(
            "1 AES_CM_128_HMAC_SHA1_80 inline:PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR UNENCRYPTED_SRTCP",
        );
        let (rem, c) = SrtpCrypto::parse(i.as_ref(), &i).unwrap();

        assert!(rem.is_empty());
        assert_eq!(c.params.len(), 1);
        assert_eq!(c.params[0], "UNENCRYPTED_SRTCP");
        assert!(c.to_string().ends_with(" UNENCRYPTED_SRTCP"));
    }

    #[test]
    fn two_keys() {
        let i = BytesStr::from_static(
            "1 AES_CM_128_HMAC_SHA1_80 inline:PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR;inline:PS1uQCVeeCFCanVmcjkpPywjNWhcYD0mXXtxaVBR|1:4",
        );
        let (_, c) = SrtpCrypto::parse(i.as_ref(), &i).unwrap();

        assert_eq!(c.keys.len(), 2);
        assert_eq!(c.keys[1].mki, Some((1, 4)));
        assert_eq!(
            c.to_string(),
            format!("1 AES_CM_128_HMAC_SHA1_80 inline:{KEY};inline:{KEY}|1:4")
        );
    }
}
