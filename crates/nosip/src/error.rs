//! The error half of the reply envelope.
//!
//! Every failed request is answered with `{nosip:"event", error_code, error}`
//! where the code is one of the values below; [`PluginError::code`] is the
//! single source of that mapping.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("no message")]
    NoMessage,
    #[error("invalid JSON: {0}")]
    InvalidJson(&'static str),
    #[error("unknown request ({0})")]
    InvalidRequest(String),
    #[error("missing element ({0})")]
    MissingElement(&'static str),
    #[error("invalid element ({0})")]
    InvalidElement(String),
    #[error("wrong state: {0}")]
    WrongState(&'static str),
    #[error("{0}")]
    MissingSdp(&'static str),
    #[error("invalid SDP: {0}")]
    InvalidSdp(String),
    #[error("{0}")]
    Io(&'static str),
    #[error("recording error: {0}")]
    Recording(&'static str),
    #[error("{0}")]
    TooStrict(&'static str),
}

impl PluginError {
    pub fn code(&self) -> u16 {
        match self {
            PluginError::NoMessage => 440,
            PluginError::InvalidJson(_) => 441,
            PluginError::InvalidRequest(_) => 442,
            PluginError::MissingElement(_) => 443,
            PluginError::InvalidElement(_) => 444,
            PluginError::WrongState(_) => 445,
            PluginError::MissingSdp(_) => 446,
            PluginError::InvalidSdp(_) => 447,
            PluginError::Io(_) => 448,
            PluginError::Recording(_) => 449,
            PluginError::TooStrict(_) => 450,
        }
    }

    pub(crate) fn invalid_element(what: impl fmt::Display) -> Self {
        PluginError::InvalidElement(what.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(PluginError::NoMessage.code(), 440);
        assert_eq!(PluginError::InvalidJson("x").code(), 441);
        assert_eq!(PluginError::InvalidRequest("x".into()).code(), 442);
        assert_eq!(PluginError::MissingElement("x").code(), 443);
        assert_eq!(PluginError::invalid_element("x").code(), 444);
        assert_eq!(PluginError::MissingSdp("x").code(), 446);
        assert_eq!(PluginError::InvalidSdp("x".into()).code(), 447);
        assert_eq!(PluginError::Io("x").code(), 448);
        assert_eq!(PluginError::Recording("x").code(), 449);
        assert_eq!(PluginError::TooStrict("x").code(), 450);
    }
}
