//! Meter block decoding
//!
//! The mixer pushes meter banks as OSC blobs of signed 16-bit big-endian
//! samples in 1/256 dB steps. An optional 4-byte big-endian length header is
//! detected structurally: when the first word equals the number of bytes that
//! follow it, it is skipped.
//!
//! Decoded levels land in a [`MeterCache`] that is overwritten wholesale on
//! every block. Consumers sample it at their own refresh rate.

use parking_lot::RwLock;

use crate::osc::address::{METERS_BUS, METERS_CHANNELS};

/// Levels at or below this are drawn as silence
pub const FLOOR_DB: f32 = -70.0;

/// Sample value meaning "no data"
pub const NO_DATA: i16 = i16::MIN;

/// Fixed-point resolution of one sample step
const STEPS_PER_DB: f32 = 256.0;

/// Convert a dB value to a 0..1 level (linear in dB between -70 and 0)
pub fn db_to_level(db: f32) -> f32 {
    if db <= FLOOR_DB {
        0.0
    } else if db >= 0.0 {
        1.0
    } else {
        (db - FLOOR_DB) / -FLOOR_DB
    }
}

/// dB value of one raw sample, `None` for the no-data sentinel
pub fn sample_to_db(sample: i16) -> Option<f32> {
    if sample == NO_DATA {
        None
    } else {
        Some(sample as f32 / STEPS_PER_DB)
    }
}

pub fn sample_to_level(sample: i16) -> f32 {
    sample_to_db(sample).map(db_to_level).unwrap_or(0.0)
}

/// Sample bytes of a block, without the length header when one is present
pub fn sample_bytes(block: &[u8]) -> &[u8] {
    if block.len() >= 6 {
        let declared = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
        if declared == block.len() - 4 {
            return &block[4..];
        }
    }
    block
}

/// Decode `count` levels. Samples missing from a short block read as no data.
pub fn decode_levels(block: &[u8], count: usize) -> Vec<f32> {
    let samples = sample_bytes(block);
    (0..count)
        .map(|idx| {
            let sample = samples
                .get(idx * 2..idx * 2 + 2)
                .map(|b| i16::from_be_bytes([b[0], b[1]]))
                .unwrap_or(NO_DATA);
            sample_to_level(sample)
        })
        .collect()
}

/// Meter bank identified by its push address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterBank {
    /// `/meters/1`: one sample per input channel
    Channels,
    /// `/meters/3`: left and right of the main bus
    StereoBus,
}

impl MeterBank {
    pub fn from_address(addr: &str) -> Option<Self> {
        match addr {
            METERS_CHANNELS => Some(MeterBank::Channels),
            METERS_BUS => Some(MeterBank::StereoBus),
            _ => None,
        }
    }

    pub fn address(&self) -> &'static str {
        match self {
            MeterBank::Channels => METERS_CHANNELS,
            MeterBank::StereoBus => METERS_BUS,
        }
    }

    /// Minimum plausible block size; shorter or odd-sized blocks are dropped
    pub fn is_valid_block(&self, block: &[u8]) -> bool {
        let min = match self {
            MeterBank::Channels => 32,
            MeterBank::StereoBus => 4,
        };
        block.len() >= min && block.len() % 2 == 0
    }
}

/// Copy of the cache at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSnapshot {
    pub channels: Vec<f32>,
    /// Left, right
    pub bus: [f32; 2],
}

/// Latest decoded levels per channel and per L/R bus side
pub struct MeterCache {
    channels: RwLock<Vec<f32>>,
    bus: RwLock<[f32; 2]>,
}

impl MeterCache {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channels: RwLock::new(vec![0.0; channel_count]),
            bus: RwLock::new([0.0; 2]),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Decode a block into the cache, replacing every slot of that bank.
    ///
    /// Returns the decoded levels for the bank.
    pub fn apply(&self, bank: MeterBank, block: &[u8]) -> Vec<f32> {
        match bank {
            MeterBank::Channels => {
                let mut channels = self.channels.write();
                let levels = decode_levels(block, channels.len());
                channels.copy_from_slice(&levels);
                levels
            }
            MeterBank::StereoBus => {
                let levels = decode_levels(block, 2);
                *self.bus.write() = [levels[0], levels[1]];
                levels
            }
        }
    }

    pub fn channel(&self, ch: u8) -> Option<f32> {
        let idx = (ch as usize).checked_sub(1)?;
        self.channels.read().get(idx).copied()
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            channels: self.channels.read().clone(),
            bus: *self.bus.read(),
        }
    }

    pub fn clear(&self) {
        self.channels.write().iter_mut().for_each(|l| *l = 0.0);
        *self.bus.write() = [0.0; 2];
    }
}
