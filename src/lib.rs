//! OSC-over-UDP remote control for X-Air style digital mixers
//!
//! Leaves first: [`osc`] encodes and decodes packets, [`meters`] turns meter
//! blobs into levels, [`transport`] owns the UDP socket, [`discovery`] finds
//! the mixer, [`throttle`] rate-limits fader gestures and [`session`] ties
//! them into a live connection.

pub mod config;
pub mod discovery;
pub mod error;
pub mod meters;
pub mod osc;
pub mod session;
pub mod throttle;
pub mod transport;

pub use error::{OscError, Result};
pub use session::{MixerEvent, SessionConfig, SessionController, SessionState};
