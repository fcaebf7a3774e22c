//! Events delivered to the UI side

use std::fmt;

use super::state::SessionState;
use crate::osc::{OscMessage, OscType, OscTypeExt, Strip};

/// Identification returned by `/xinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerInfo {
    pub address: String,
    pub name: String,
    pub model: String,
    pub firmware: String,
}

impl MixerInfo {
    /// Parse the four string arguments of an `/xinfo` reply. Missing trailing
    /// fields read as `"?"`; a non-string argument or no arguments at all
    /// yields `None`.
    pub fn from_args(args: &[OscType]) -> Option<Self> {
        if args.is_empty() {
            return None;
        }
        let mut fields = Vec::with_capacity(4);
        for arg in args.iter().take(4) {
            fields.push(arg.as_str()?.to_string());
        }
        fields.resize(4, "?".to_string());

        let mut fields = fields.into_iter();
        let mut next = || fields.next().unwrap_or_default();
        Some(Self {
            address: next(),
            name: next(),
            model: next(),
            firmware: next(),
        })
    }
}

impl fmt::Display for MixerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" at {} (firmware {})",
            self.model, self.name, self.address, self.firmware
        )
    }
}

/// Decoded inbound traffic and session changes. Meter levels are not
/// events; they are sampled from the session's meter cache.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerEvent {
    /// Every non-meter inbound message, as decoded
    Message(OscMessage),
    Fader { strip: Strip, value: f32 },
    Mute { strip: Strip, muted: bool },
    Info(MixerInfo),
    StateChanged(SessionState),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<OscType> {
        values.iter().map(|s| OscType::String(s.to_string())).collect()
    }

    #[test]
    fn test_full_info() {
        let info = MixerInfo::from_args(&strings(&["192.168.1.20", "Stage", "XR18", "1.22"])).unwrap();
        assert_eq!(info.name, "Stage");
        assert_eq!(info.model, "XR18");
        assert_eq!(info.to_string(), "XR18 \"Stage\" at 192.168.1.20 (firmware 1.22)");
    }

    #[test]
    fn test_missing_fields_default() {
        let info = MixerInfo::from_args(&strings(&["10.0.0.2", "Desk"])).unwrap();
        assert_eq!(info.model, "?");
        assert_eq!(info.firmware, "?");
    }

    #[test]
    fn test_rejects_non_string() {
        assert!(MixerInfo::from_args(&[]).is_none());
        assert!(MixerInfo::from_args(&[OscType::String("a".into()), OscType::Int(3)]).is_none());
    }
}
