//! Throttled fader command channel
//!
//! One slot per tracked channel fader plus one for the main bus. During a
//! gesture every intent only updates the slot's latest value and arms a
//! fixed-period timer; the timer sends when the value moved by more than
//! `epsilon` since the last send and re-arms while the gesture is live.
//! Release cancels the timer and flushes once, so the last value on the wire
//! is always the user's final intent.
//!
//! Timers carry the slot epoch they were armed with; a timer whose epoch is
//! stale (slot released or re-armed meanwhile) does nothing when it fires.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::osc::address::clamp_unit;
use crate::osc::Strip;

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(33);

/// ≈0.05% of full scale
pub const DEFAULT_EPSILON: f32 = 0.0005;

/// Transmit one fader value. Called with the slot locked; must not block.
pub type FaderSendFn = Arc<dyn Fn(Strip, f32) + Send + Sync>;

/// Rate-limit state for one fader
#[derive(Debug, Default)]
pub struct ThrottleSlot {
    pub latest_intended: f32,
    /// `None` until the first send
    pub last_sent: Option<f32>,
    pub armed: bool,
    pub gesture_active: bool,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl ThrottleSlot {
    fn differs(&self, epsilon: f32) -> bool {
        match self.last_sent {
            None => true,
            Some(sent) => (self.latest_intended - sent).abs() > epsilon,
        }
    }

    /// Record an intent. Returns the epoch to arm a timer with, if the slot
    /// was not armed yet.
    fn intend(&mut self, value: f32) -> Option<u64> {
        self.latest_intended = value;
        self.gesture_active = true;
        if self.armed {
            return None;
        }
        self.armed = true;
        self.epoch += 1;
        Some(self.epoch)
    }

    /// Timer expiry. Returns the value to send and whether to re-arm.
    fn fire(&mut self, epoch: u64, epsilon: f32) -> (Option<f32>, Option<u64>) {
        if !self.armed || self.epoch != epoch {
            return (None, None);
        }
        self.timer = None;

        if !self.differs(epsilon) {
            self.armed = false;
            return (None, None);
        }

        self.last_sent = Some(self.latest_intended);
        if self.gesture_active {
            self.epoch += 1;
            (self.last_sent, Some(self.epoch))
        } else {
            self.armed = false;
            (self.last_sent, None)
        }
    }

    /// End of gesture: disarm and return the final value if it still needs
    /// sending
    fn release(&mut self, epsilon: f32) -> Option<f32> {
        self.gesture_active = false;
        self.armed = false;
        self.epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        if self.differs(epsilon) {
            self.last_sent = Some(self.latest_intended);
            self.last_sent
        } else {
            None
        }
    }
}

struct Inner {
    /// Channels 1..=N at index 0..N, main bus at index N
    slots: Vec<Mutex<ThrottleSlot>>,
    period: Duration,
    epsilon: f32,
    sender: FaderSendFn,
    runtime: Handle,
}

impl Inner {
    fn slot_index(&self, strip: Strip) -> Option<usize> {
        let channels = self.slots.len() - 1;
        match strip {
            Strip::MainLr => Some(channels),
            Strip::Channel(ch) if (1..=channels).contains(&(ch as usize)) => Some(ch as usize - 1),
            Strip::Channel(_) => None,
        }
    }

    fn arm(self: &Arc<Self>, strip: Strip, slot: &mut ThrottleSlot, epoch: u64) {
        let inner = Arc::clone(self);
        slot.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(inner.period).await;
            inner.on_timer(strip, epoch);
        }));
    }

    fn on_timer(self: &Arc<Self>, strip: Strip, epoch: u64) {
        let Some(idx) = self.slot_index(strip) else {
            return;
        };
        let mut slot = self.slots[idx].lock();
        let (value, rearm) = slot.fire(epoch, self.epsilon);
        if let Some(value) = value {
            trace!("Throttle send {} = {:.4}", strip, value);
            (self.sender)(strip, value);
        }
        if let Some(epoch) = rearm {
            self.arm(strip, &mut slot, epoch);
        }
    }
}

/// Per-fader rate limiter with guaranteed final delivery
pub struct FaderThrottle {
    inner: Arc<Inner>,
}

impl FaderThrottle {
    /// Slots for channels `1..=channels` and the main bus.
    ///
    /// Must be called within a tokio runtime; timers are spawned on it.
    pub fn new(channels: u8, period: Duration, epsilon: f32, sender: FaderSendFn) -> Self {
        let slots = (0..=channels as usize)
            .map(|_| Mutex::new(ThrottleSlot::default()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                slots,
                period,
                epsilon,
                sender,
                runtime: Handle::current(),
            }),
        }
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// UI intent during a gesture. Returns `false` for an untracked strip.
    pub fn intend(&self, strip: Strip, value: f32) -> bool {
        let Some(idx) = self.inner.slot_index(strip) else {
            return false;
        };
        let mut slot = self.inner.slots[idx].lock();
        if let Some(epoch) = slot.intend(clamp_unit(value)) {
            self.inner.arm(strip, &mut slot, epoch);
        }
        true
    }

    /// End the gesture and flush the final value. Returns what was sent.
    pub fn release(&self, strip: Strip) -> Option<f32> {
        let idx = self.inner.slot_index(strip)?;
        let mut slot = self.inner.slots[idx].lock();
        let value = slot.release(self.inner.epsilon)?;
        trace!("Throttle flush {} = {:.4}", strip, value);
        (self.inner.sender)(strip, value);
        Some(value)
    }

    pub fn is_gesture_active(&self, strip: Strip) -> bool {
        self.inner
            .slot_index(strip)
            .map(|idx| self.inner.slots[idx].lock().gesture_active)
            .unwrap_or(false)
    }

    pub fn last_sent(&self, strip: Strip) -> Option<f32> {
        let idx = self.inner.slot_index(strip)?;
        self.inner.slots[idx].lock().last_sent
    }

    /// Forget what was sent (after a reconnect) and cancel pending timers
    pub fn reset(&self) {
        for slot in &self.inner.slots {
            let mut slot = slot.lock();
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            let epoch = slot.epoch + 1;
            *slot = ThrottleSlot {
                epoch,
                ..ThrottleSlot::default()
            };
        }
    }
}

impl Drop for FaderThrottle {
    fn drop(&mut self) {
        for slot in &self.inner.slots {
            if let Some(timer) = slot.lock().timer.take() {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<(Strip, f32)>>>;

    fn recording(channels: u8) -> (FaderThrottle, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let throttle = FaderThrottle::new(
            channels,
            DEFAULT_PERIOD,
            DEFAULT_EPSILON,
            Arc::new(move |strip: Strip, value: f32| sink.lock().push((strip, value))),
        );
        (throttle, log)
    }

    #[test]
    fn test_slot_fire_rules() {
        let mut slot = ThrottleSlot::default();
        let epoch = slot.intend(0.5).unwrap();
        assert!(slot.intend(0.6).is_none(), "already armed");

        let (sent, rearm) = slot.fire(epoch, DEFAULT_EPSILON);
        assert_eq!(sent, Some(0.6));
        let epoch = rearm.unwrap();

        // Movement below epsilon: disarm without sending
        slot.latest_intended = 0.6002;
        assert_eq!(slot.fire(epoch, DEFAULT_EPSILON), (None, None));
        assert!(!slot.armed);

        // Stale epoch is ignored
        let epoch = slot.intend(0.9).unwrap();
        assert_eq!(slot.fire(epoch - 1, DEFAULT_EPSILON), (None, None));
        assert!(slot.armed);
    }

    #[test]
    fn test_slot_release_dedup() {
        let mut slot = ThrottleSlot::default();
        slot.intend(0.25);
        assert_eq!(slot.release(DEFAULT_EPSILON), Some(0.25));
        assert!(!slot.gesture_active);

        slot.intend(0.2502);
        assert_eq!(slot.release(DEFAULT_EPSILON), None);
        assert_eq!(slot.last_sent, Some(0.25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_gesture_converges_on_release() {
        let (throttle, log) = recording(8);
        let strip = Strip::Channel(1);

        // 1000 monotonically increasing intents over 100 ms
        for i in 0..1000 {
            throttle.intend(strip, i as f32 / 999.0);
            if i % 10 == 9 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        assert!(throttle.is_gesture_active(strip));

        // A tick may already have sent 1.0, in which case release has
        // nothing left to flush
        let flushed = throttle.release(strip);
        assert!(flushed.is_none() || flushed == Some(1.0), "{:?}", flushed);
        assert_eq!(throttle.last_sent(strip), Some(1.0));

        let sends = log.lock().len();
        assert!(sends < 1000, "{} sends", sends);
        assert!(sends >= 2, "timer never fired: {} sends", sends);
        assert_eq!(log.lock().last(), Some(&(strip, 1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_sends_during_gesture_and_stops_when_idle() {
        let (throttle, log) = recording(2);

        throttle.intend(Strip::MainLr, 0.4);
        assert!(log.lock().is_empty(), "nothing sent before the first tick");

        tokio::time::sleep(DEFAULT_PERIOD + Duration::from_millis(1)).await;
        assert_eq!(log.lock().as_slice(), &[(Strip::MainLr, 0.4)]);

        // No movement: next tick disarms, nothing else goes out
        tokio::time::sleep(DEFAULT_PERIOD * 4).await;
        assert_eq!(log.lock().len(), 1);

        // Release without movement sends nothing
        assert_eq!(throttle.release(Strip::MainLr), None);
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cancels_pending_timer() {
        let (throttle, log) = recording(2);
        throttle.intend(Strip::Channel(2), 0.7);
        assert_eq!(throttle.release(Strip::Channel(2)), Some(0.7));

        tokio::time::sleep(DEFAULT_PERIOD * 3).await;
        assert_eq!(log.lock().as_slice(), &[(Strip::Channel(2), 0.7)]);
    }

    #[tokio::test]
    async fn test_untracked_strip() {
        let (throttle, log) = recording(2);
        assert!(!throttle.intend(Strip::Channel(3), 0.5));
        assert_eq!(throttle.release(Strip::Channel(3)), None);
        assert!(!throttle.is_gesture_active(Strip::Channel(3)));
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_last_sent() {
        let (throttle, log) = recording(1);
        throttle.intend(Strip::Channel(1), 0.3);
        throttle.release(Strip::Channel(1));
        throttle.reset();
        assert_eq!(throttle.last_sent(Strip::Channel(1)), None);

        throttle.intend(Strip::Channel(1), 0.3);
        assert_eq!(throttle.release(Strip::Channel(1)), Some(0.3));
        assert_eq!(log.lock().len(), 2);
    }
}
