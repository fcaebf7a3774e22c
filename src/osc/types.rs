//! OSC data model
//!
//! Messages, bundles and argument values are rosc's types. This module adds
//! the small accessors the mixer client needs on top of them.

use std::fmt;

pub use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};

/// "Immediately" timetag as defined by OSC 1.0
pub const TIMETAG_IMMEDIATE: OscTime = OscTime {
    seconds: 0,
    fractional: 1,
};

/// Build a message from an address and its arguments
pub fn message(addr: impl Into<String>, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.into(),
        args,
    }
}

/// Message without arguments (probes, keep-alive)
pub fn bare(addr: impl Into<String>) -> OscMessage {
    message(addr, Vec::new())
}

/// Typed views of a single argument
pub trait OscTypeExt {
    /// Typetag character, `None` for types the mixer never uses
    fn tag(&self) -> Option<char>;
    fn as_int(&self) -> Option<i32>;
    fn as_float(&self) -> Option<f32>;
    fn as_str(&self) -> Option<&str>;
    fn as_blob(&self) -> Option<&[u8]>;
}

impl OscTypeExt for OscType {
    fn tag(&self) -> Option<char> {
        match self {
            OscType::Int(_) => Some('i'),
            OscType::Float(_) => Some('f'),
            OscType::String(_) => Some('s'),
            OscType::Bool(true) => Some('T'),
            OscType::Bool(false) => Some('F'),
            OscType::Blob(_) => Some('b'),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i32> {
        match self {
            OscType::Int(v) => Some(*v),
            OscType::Float(v) => Some(*v as i32),
            OscType::Bool(b) => Some(*b as i32),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f32> {
        match self {
            OscType::Float(v) => Some(*v),
            OscType::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            OscType::String(s) => Some(s),
            _ => None,
        }
    }

    fn as_blob(&self) -> Option<&[u8]> {
        match self {
            OscType::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// Message helpers
pub trait OscMessageExt {
    /// Typetag string without the leading ','; `?` for types outside the
    /// mixer's set
    fn typetags(&self) -> String;
    fn first_arg(&self) -> Option<&OscType>;
    /// Compact one-line rendering for logs and the monitor
    fn display(&self) -> MessageDisplay<'_>;
}

impl OscMessageExt for OscMessage {
    fn typetags(&self) -> String {
        self.args.iter().map(|a| a.tag().unwrap_or('?')).collect()
    }

    fn first_arg(&self) -> Option<&OscType> {
        self.args.first()
    }

    fn display(&self) -> MessageDisplay<'_> {
        MessageDisplay(self)
    }
}

pub struct MessageDisplay<'a>(&'a OscMessage);

impl fmt::Display for MessageDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.0;
        write!(f, "{} ,{}", msg.addr, msg.typetags())?;
        for arg in &msg.args {
            match arg {
                OscType::Int(v) => write!(f, " {}", v)?,
                OscType::Float(v) => write!(f, " {:.4}", v)?,
                OscType::String(s) => write!(f, " {:?}", s)?,
                OscType::Bool(b) => write!(f, " {}", b)?,
                OscType::Blob(b) => write!(f, " <blob {} bytes>", b.len())?,
                other => write!(f, " {:?}", other)?,
            }
        }
        Ok(())
    }
}

/// Flatten nested bundles into their messages, in wire order
pub fn into_messages(packet: OscPacket) -> Vec<OscMessage> {
    let mut out = Vec::new();
    collect_into(packet, &mut out);
    out
}

fn collect_into(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(msg),
        OscPacket::Bundle(bundle) => {
            for element in bundle.content {
                collect_into(element, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typetags() {
        let msg = message(
            "/x",
            vec![
                OscType::Int(1),
                OscType::Float(0.5),
                OscType::String("a".into()),
                OscType::Bool(true),
                OscType::Bool(false),
                OscType::Blob(vec![]),
                OscType::Nil,
            ],
        );
        assert_eq!(msg.typetags(), "ifsTFb?");
    }

    #[test]
    fn test_display() {
        let msg = message(
            "/ch/01/mix/fader",
            vec![OscType::Float(0.5), OscType::String("x".into())],
        );
        assert_eq!(msg.display().to_string(), "/ch/01/mix/fader ,fs 0.5000 \"x\"");
    }

    #[test]
    fn test_flatten_nested_bundle() {
        let inner = OscPacket::Bundle(OscBundle {
            timetag: TIMETAG_IMMEDIATE,
            content: vec![OscPacket::Message(bare("/b"))],
        });
        let outer = OscPacket::Bundle(OscBundle {
            timetag: TIMETAG_IMMEDIATE,
            content: vec![
                OscPacket::Message(bare("/a")),
                inner,
                OscPacket::Message(bare("/c")),
            ],
        });

        let addrs: Vec<String> = into_messages(outer).into_iter().map(|m| m.addr).collect();
        assert_eq!(addrs, vec!["/a", "/b", "/c"]);
    }
}
