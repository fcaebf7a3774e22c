//! Connection state and the local mirror of mixer parameters

use std::fmt;

use crate::osc::Strip;

/// Connection lifecycle: `Idle → Bound → Targeted → Live`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No socket
    Idle,
    /// Socket open, no mixer address yet
    Bound,
    /// Socket open and mixer address known
    Targeted,
    /// Keep-alive running, meters subscribed, initial sync issued
    Live,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Bound => "bound",
            SessionState::Targeted => "targeted",
            SessionState::Live => "live",
        };
        f.write_str(s)
    }
}

/// Last known values of one strip (`None` until seen or set)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StripState {
    pub fader: Option<f32>,
    pub muted: Option<bool>,
}

/// Mirror of the tracked channel strips and the main bus
#[derive(Debug, Clone)]
pub struct MixerState {
    channels: Vec<StripState>,
    main: StripState,
}

impl MixerState {
    pub fn new(channels: u8) -> Self {
        Self {
            channels: vec![StripState::default(); channels as usize],
            main: StripState::default(),
        }
    }

    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    pub fn strip(&self, strip: Strip) -> Option<StripState> {
        match strip {
            Strip::MainLr => Some(self.main),
            Strip::Channel(ch) => self.channels.get((ch as usize).checked_sub(1)?).copied(),
        }
    }

    fn strip_mut(&mut self, strip: Strip) -> Option<&mut StripState> {
        match strip {
            Strip::MainLr => Some(&mut self.main),
            Strip::Channel(ch) => self.channels.get_mut((ch as usize).checked_sub(1)?),
        }
    }

    /// Returns `false` when the strip is not tracked
    pub fn set_fader(&mut self, strip: Strip, value: f32) -> bool {
        match self.strip_mut(strip) {
            Some(s) => {
                s.fader = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn set_muted(&mut self, strip: Strip, muted: bool) -> bool {
        match self.strip_mut(strip) {
            Some(s) => {
                s.muted = Some(muted);
                true
            }
            None => false,
        }
    }

    pub fn fader(&self, strip: Strip) -> Option<f32> {
        self.strip(strip)?.fader
    }

    pub fn muted(&self, strip: Strip) -> Option<bool> {
        self.strip(strip)?.muted
    }

    /// Tracked strips in sync order: channels ascending, then the main bus
    pub fn strips(&self) -> impl Iterator<Item = (Strip, StripState)> + '_ {
        self.channels
            .iter()
            .enumerate()
            .map(|(idx, s)| (Strip::Channel(idx as u8 + 1), *s))
            .chain(std::iter::once((Strip::MainLr, self.main)))
    }

    pub fn clear(&mut self) {
        self.channels.iter_mut().for_each(|s| *s = StripState::default());
        self.main = StripState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_tracks_only_configured_channels() {
        let mut state = MixerState::new(2);
        assert!(state.set_fader(Strip::Channel(2), 0.5));
        assert!(!state.set_fader(Strip::Channel(3), 0.5));
        assert!(!state.set_fader(Strip::Channel(0), 0.5));
        assert!(state.set_muted(Strip::MainLr, true));

        assert_eq!(state.fader(Strip::Channel(2)), Some(0.5));
        assert_eq!(state.fader(Strip::Channel(1)), None);
        assert_eq!(state.muted(Strip::MainLr), Some(true));
        assert_eq!(state.strip(Strip::Channel(3)), None);
    }

    #[test]
    fn test_strip_order_and_clear() {
        let mut state = MixerState::new(3);
        let order: Vec<Strip> = state.strips().map(|(s, _)| s).collect();
        assert_eq!(
            order,
            vec![Strip::Channel(1), Strip::Channel(2), Strip::Channel(3), Strip::MainLr]
        );

        state.set_fader(Strip::Channel(1), 0.1);
        state.clear();
        assert!(state.strips().all(|(_, s)| s == StripState::default()));
    }
}
