//! Mixer address catalogue
//!
//! Builders for the messages the client sends and a parser for the strip
//! parameters it tracks. Channels are 1-based, clamped to 1..=32 and
//! zero-padded to two digits (`/ch/03/mix/fader`).

use std::fmt;

use super::types::{bare, message, OscMessage, OscType};

/// Default mixer control port
pub const MIXER_PORT: u16 = 10024;

/// Highest channel index addressable on the console
pub const MAX_CHANNEL: u8 = 32;

pub const XINFO: &str = "/xinfo";
pub const XREMOTE: &str = "/xremote";
pub const PREFS_NAME: &str = "/-prefs/name";
pub const METERS: &str = "/meters";
/// Per-channel meter bank
pub const METERS_CHANNELS: &str = "/meters/1";
/// Stereo bus (L/R) meter bank
pub const METERS_BUS: &str = "/meters/3";
pub const MAIN_FADER: &str = "/lr/mix/fader";
pub const MAIN_ON: &str = "/lr/mix/on";

/// Argument that turns a message into a GET-style query
pub const QUERY_MARKER: &str = "?";

/// A fader/mute strip: numbered input channel or the main L/R bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strip {
    Channel(u8),
    MainLr,
}

impl Strip {
    /// Channel strip with the index clamped to 1..=32
    pub fn channel(ch: i32) -> Self {
        Strip::Channel(clamp_channel(ch))
    }

    pub fn fader_path(&self) -> String {
        match self {
            Strip::Channel(ch) => format!("/ch/{:02}/mix/fader", clamp_channel(*ch as i32)),
            Strip::MainLr => MAIN_FADER.to_string(),
        }
    }

    pub fn mute_path(&self) -> String {
        match self {
            Strip::Channel(ch) => format!("/ch/{:02}/mix/on", clamp_channel(*ch as i32)),
            Strip::MainLr => MAIN_ON.to_string(),
        }
    }
}

impl fmt::Display for Strip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strip::Channel(ch) => write!(f, "ch{:02}", ch),
            Strip::MainLr => write!(f, "lr"),
        }
    }
}

/// Which strip parameter an address refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripParam {
    Fader,
    /// `on` switch (1 = unmuted)
    On,
}

pub fn clamp_channel(ch: i32) -> u8 {
    ch.clamp(1, MAX_CHANNEL as i32) as u8
}

/// Parse `/ch/NN/mix/fader`, `/ch/NN/mix/on`, `/lr/mix/fader`, `/lr/mix/on`
pub fn parse_strip_path(addr: &str) -> Option<(Strip, StripParam)> {
    let (strip, rest) = if let Some(rest) = addr.strip_prefix("/lr") {
        (Strip::MainLr, rest)
    } else {
        let rest = addr.strip_prefix("/ch/")?;
        let digits = rest.get(..2)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let ch: u8 = digits.parse().ok()?;
        if !(1..=MAX_CHANNEL).contains(&ch) {
            return None;
        }
        (Strip::Channel(ch), &rest[2..])
    };

    match rest {
        "/mix/fader" => Some((strip, StripParam::Fader)),
        "/mix/on" => Some((strip, StripParam::On)),
        _ => None,
    }
}

/// Set a fader; the value is clamped to 0..1
pub fn set_fader(strip: Strip, value: f32) -> OscMessage {
    message(strip.fader_path(), vec![OscType::Float(clamp_unit(value))])
}

/// Set a mute switch. The wire value is inverted: `on = 1` means unmuted.
pub fn set_mute(strip: Strip, muted: bool) -> OscMessage {
    message(strip.mute_path(), vec![OscType::Int(if muted { 0 } else { 1 })])
}

/// GET-style query: the path with a single `"?"` string argument
pub fn query(path: impl Into<String>) -> OscMessage {
    message(path, vec![OscType::String(QUERY_MARKER.to_string())])
}

/// Feedback registration (keep-alive)
pub fn xremote() -> OscMessage {
    bare(XREMOTE)
}

pub fn xinfo() -> OscMessage {
    bare(XINFO)
}

pub fn prefs_name() -> OscMessage {
    bare(PREFS_NAME)
}

/// Meter subscription for one bank at the fastest refresh (0)
pub fn subscribe_meters(bank: &str) -> OscMessage {
    message(METERS, vec![OscType::String(bank.to_string()), OscType::Int(0)])
}

pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::types::OscMessageExt;

    #[test]
    fn test_channel_fader_message() {
        let msg = set_fader(Strip::channel(3), 0.5);
        assert_eq!(msg.addr, "/ch/03/mix/fader");
        assert_eq!(msg.args, vec![OscType::Float(0.5)]);
    }

    #[test]
    fn test_channel_clamping() {
        assert_eq!(Strip::channel(0).fader_path(), "/ch/01/mix/fader");
        assert_eq!(Strip::channel(-7).mute_path(), "/ch/01/mix/on");
        assert_eq!(Strip::channel(40).fader_path(), "/ch/32/mix/fader");
        assert_eq!(Strip::channel(12).fader_path(), "/ch/12/mix/fader");
    }

    #[test]
    fn test_value_clamping() {
        assert_eq!(set_fader(Strip::MainLr, 1.7).args, vec![OscType::Float(1.0)]);
        assert_eq!(set_fader(Strip::MainLr, -0.2).args, vec![OscType::Float(0.0)]);
        assert_eq!(set_fader(Strip::MainLr, f32::NAN).args, vec![OscType::Float(0.0)]);
    }

    #[test]
    fn test_mute_is_inverted() {
        assert_eq!(set_mute(Strip::channel(1), true).args, vec![OscType::Int(0)]);
        assert_eq!(set_mute(Strip::MainLr, false).args, vec![OscType::Int(1)]);
        assert_eq!(set_mute(Strip::MainLr, false).addr, "/lr/mix/on");
    }

    #[test]
    fn test_query_and_subscribe() {
        let q = query("/ch/05/mix/on");
        assert_eq!(q.args, vec![OscType::String("?".into())]);

        let sub = subscribe_meters(METERS_CHANNELS);
        assert_eq!(sub.addr, "/meters");
        assert_eq!(sub.typetags(), "si");
        assert_eq!(sub.args[1], OscType::Int(0));
    }

    #[test]
    fn test_parse_strip_path() {
        assert_eq!(
            parse_strip_path("/ch/07/mix/fader"),
            Some((Strip::Channel(7), StripParam::Fader))
        );
        assert_eq!(parse_strip_path("/ch/32/mix/on"), Some((Strip::Channel(32), StripParam::On)));
        assert_eq!(parse_strip_path("/lr/mix/fader"), Some((Strip::MainLr, StripParam::Fader)));
        assert_eq!(parse_strip_path("/lr/mix/on"), Some((Strip::MainLr, StripParam::On)));

        assert_eq!(parse_strip_path("/ch/00/mix/fader"), None);
        assert_eq!(parse_strip_path("/ch/33/mix/fader"), None);
        assert_eq!(parse_strip_path("/ch/7/mix/fader"), None);
        assert_eq!(parse_strip_path("/ch/07/mix/pan"), None);
        assert_eq!(parse_strip_path("/bus/01/mix/fader"), None);
    }
}
