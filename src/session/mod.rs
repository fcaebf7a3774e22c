//! Mixer session controller
//!
//! Owns the transport, the meter cache, the parameter mirror and the fader
//! throttle, and drives the connection through
//! `Idle → Bound → Targeted → Live`. Going live starts the `/xremote`
//! keep-alive, subscribes to both meter banks and queries every tracked
//! parameter; the answers come back through the normal inbound path and are
//! matched by address only.
//!
//! Inbound traffic is turned into [`MixerEvent`]s on a bounded channel. A
//! full channel drops the event rather than stall the receive loop. Meter
//! blocks never enter that channel: they overwrite the meter cache and bump
//! a coalescing `watch` counter that consumers sample at their own pace.

mod events;
mod state;

pub use events::{MixerEvent, MixerInfo};
pub use state::{MixerState, SessionState, StripState};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::discovery::{Cidr, Discovery};
use crate::error::{OscError, Result};
use crate::meters::{MeterBank, MeterCache, MeterSnapshot};
use crate::osc::address::{self, clamp_unit, parse_strip_path};
use crate::osc::{OscMessage, OscMessageExt, OscTypeExt, Strip, StripParam, MIXER_PORT};
use crate::throttle::{FaderThrottle, DEFAULT_EPSILON, DEFAULT_PERIOD};
use crate::transport::{OscTransport, TransportStats};

/// Runtime parameters of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_port: u16,
    pub mixer_port: u16,
    /// Tracked input channels (1..=32)
    pub channels: u8,
    pub keepalive: Duration,
    pub subscribe_meters: bool,
    pub throttle_period: Duration,
    pub throttle_epsilon: f32,
    pub discovery_timeout: Duration,
    pub discovery_max_hosts: u64,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_port: 12000,
            mixer_port: MIXER_PORT,
            channels: 8,
            keepalive: Duration::from_secs(5),
            subscribe_meters: true,
            throttle_period: DEFAULT_PERIOD,
            throttle_epsilon: DEFAULT_EPSILON,
            discovery_timeout: crate::discovery::DEFAULT_TIMEOUT,
            discovery_max_hosts: crate::discovery::DEFAULT_MAX_HOSTS,
            event_capacity: 1024,
        }
    }
}

/// Queue an event without waiting; a full queue drops it with a warning
fn emit(events: &mpsc::Sender<MixerEvent>, event: MixerEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!("Event queue full, dropping {:?}", event);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Inbound message handling, shared with the transport's receive loop
struct Dispatcher {
    events: mpsc::Sender<MixerEvent>,
    mixer: Arc<RwLock<MixerState>>,
    meters: Arc<MeterCache>,
    /// Bumped after every applied meter block
    meter_seq: Arc<watch::Sender<u64>>,
    info: Arc<RwLock<Option<MixerInfo>>>,
    throttle: Arc<FaderThrottle>,
}

impl Dispatcher {
    fn emit(&self, event: MixerEvent) {
        emit(&self.events, event);
    }

    fn dispatch(&self, msg: OscMessage) {
        if let Some(bank) = MeterBank::from_address(&msg.addr) {
            self.dispatch_meters(bank, &msg);
            return;
        }

        let typed = if msg.addr == address::XINFO {
            self.parse_info(&msg)
        } else if let Some((strip, param)) = parse_strip_path(&msg.addr) {
            self.apply_strip(strip, param, &msg)
        } else {
            None
        };

        self.emit(MixerEvent::Message(msg));
        if let Some(event) = typed {
            self.emit(event);
        }
    }

    fn dispatch_meters(&self, bank: MeterBank, msg: &OscMessage) {
        let Some(block) = msg.first_arg().and_then(|arg| arg.as_blob()) else {
            debug!("{} without blob argument ({})", msg.addr, msg.typetags());
            return;
        };
        if !bank.is_valid_block(block) {
            debug!(
                "Dropping {} block of {} bytes [{}]",
                msg.addr,
                block.len(),
                hex::encode(&block[..block.len().min(16)])
            );
            return;
        }
        let levels = self.meters.apply(bank, block);
        trace!("{} applied ({} levels)", bank.address(), levels.len());
        self.meter_seq.send_modify(|seq| *seq = seq.wrapping_add(1));
    }

    fn parse_info(&self, msg: &OscMessage) -> Option<MixerEvent> {
        let info = MixerInfo::from_args(&msg.args)?;
        info!("🎛️ {}", info);
        *self.info.write() = Some(info.clone());
        Some(MixerEvent::Info(info))
    }

    fn apply_strip(&self, strip: Strip, param: StripParam, msg: &OscMessage) -> Option<MixerEvent> {
        let arg = msg.first_arg()?;
        match param {
            StripParam::Fader => {
                let value = clamp_unit(arg.as_float()?);
                if !self.mixer.write().set_fader(strip, value) {
                    return None;
                }
                if self.throttle.is_gesture_active(strip) {
                    trace!("Fader echo for {} during gesture", strip);
                    return None;
                }
                Some(MixerEvent::Fader { strip, value })
            }
            StripParam::On => {
                let muted = arg.as_int()? == 0;
                if !self.mixer.write().set_muted(strip, muted) {
                    return None;
                }
                Some(MixerEvent::Mute { strip, muted })
            }
        }
    }
}

/// Connection to one mixer
pub struct SessionController {
    config: SessionConfig,
    transport: Arc<OscTransport>,
    state: RwLock<SessionState>,
    mixer: Arc<RwLock<MixerState>>,
    meters: Arc<MeterCache>,
    meter_seq: Arc<watch::Sender<u64>>,
    info: Arc<RwLock<Option<MixerInfo>>>,
    throttle: Arc<FaderThrottle>,
    /// Last `on` value sent per strip
    mute_sent: Mutex<HashMap<Strip, bool>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<MixerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<MixerEvent>>>,
}

impl SessionController {
    /// Must be called within a tokio runtime.
    pub fn new(config: SessionConfig) -> Self {
        let channels = address::clamp_channel(config.channels as i32);
        let transport = Arc::new(OscTransport::new());
        let mixer = Arc::new(RwLock::new(MixerState::new(channels)));
        let meters = Arc::new(MeterCache::new(channels as usize));
        let info = Arc::new(RwLock::new(None));

        // Weak: the transport's handler owns the throttle
        let weak_transport = Arc::downgrade(&transport);
        let mirror = Arc::clone(&mixer);
        let throttle = Arc::new(FaderThrottle::new(
            channels,
            config.throttle_period,
            config.throttle_epsilon,
            Arc::new(move |strip: Strip, value: f32| {
                let Some(transport) = weak_transport.upgrade() else {
                    return;
                };
                mirror.write().set_fader(strip, value);
                if let Err(e) = transport.send_message(&address::set_fader(strip, value)) {
                    warn!("Throttled fader send for {} failed: {}", strip, e);
                }
            }),
        ));

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (meter_seq, _) = watch::channel(0u64);
        let meter_seq = Arc::new(meter_seq);

        let dispatcher = Arc::new(Dispatcher {
            events: event_tx.clone(),
            mixer: Arc::clone(&mixer),
            meters: Arc::clone(&meters),
            meter_seq: Arc::clone(&meter_seq),
            info: Arc::clone(&info),
            throttle: Arc::clone(&throttle),
        });
        transport.set_packet_handler(Arc::new(move |msg: OscMessage, _from: SocketAddr| {
            dispatcher.dispatch(msg)
        }));

        Self {
            config: SessionConfig { channels, ..config },
            transport,
            state: RwLock::new(SessionState::Idle),
            mixer,
            meters,
            meter_seq,
            info,
            throttle,
            mute_sent: Mutex::new(HashMap::new()),
            keepalive_task: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Hand the event stream to the consumer. Only the first call gets it.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<MixerEvent>> {
        self.event_rx.lock().take()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, next: SessionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!("Session {} → {}", prev, next);
            emit(&self.event_tx, MixerEvent::StateChanged(next));
        }
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.transport.target()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn stats(&self) -> &TransportStats {
        self.transport.stats()
    }

    pub fn info(&self) -> Option<MixerInfo> {
        self.info.read().clone()
    }

    pub fn meters(&self) -> MeterSnapshot {
        self.meters.snapshot()
    }

    /// Changes whenever a meter block has been applied. Updates coalesce:
    /// a slow reader sees the latest count, then samples [`meters`](Self::meters).
    pub fn meter_updates(&self) -> watch::Receiver<u64> {
        self.meter_seq.subscribe()
    }

    pub fn mixer_state(&self) -> MixerState {
        self.mixer.read().clone()
    }

    // ===== Lifecycle =====

    /// Bind the local port (`Idle → Bound`)
    pub fn open(&self) -> Result<SocketAddr> {
        let local = self.transport.open(self.config.local_port)?;
        if self.state() == SessionState::Idle {
            if self.transport.target().is_some() {
                self.set_state(SessionState::Targeted);
            } else {
                self.set_state(SessionState::Bound);
            }
        }
        Ok(local)
    }

    /// Point the session at a mixer (`Bound → Targeted`). A live session
    /// stays live; callers re-sync after retargeting.
    pub fn set_target(&self, target: SocketAddr) {
        let changed = self.transport.target() != Some(target);
        self.transport.set_target(target);
        if changed {
            self.mute_sent.lock().clear();
            self.throttle.reset();
            *self.info.write() = None;
        }
        if self.state() == SessionState::Bound {
            self.set_state(SessionState::Targeted);
        }
    }

    fn discovery(&self) -> Discovery {
        Discovery::new(self.config.mixer_port, self.config.discovery_timeout)
            .with_max_hosts(self.config.discovery_max_hosts)
    }

    /// Scan `cidr` (or every local interface) and target the first responder
    pub async fn discover(&self, cidr: Option<Cidr>) -> Result<SocketAddr> {
        let found = self.discovery().discover(cidr).await?;
        self.set_target(found);
        Ok(found)
    }

    /// Broadcast probe; targets the first responder
    pub async fn discover_broadcast(&self) -> Result<SocketAddr> {
        let found = self.discovery().broadcast().await?;
        self.set_target(found);
        Ok(found)
    }

    /// Start keep-alive, subscribe meters and sync (`Targeted → Live`)
    pub fn go_live(&self) -> Result<()> {
        if !self.transport.is_open() {
            return Err(OscError::NotOpen);
        }
        if self.transport.target().is_none() {
            return Err(OscError::NoTargetConfigured);
        }

        self.start_keepalive()?;
        if self.config.subscribe_meters {
            self.subscribe_meters()?;
        }
        self.query_info()?;
        self.sync_all()?;

        self.set_state(SessionState::Live);
        info!("✅ Session live with {}", self.target().map(|t| t.to_string()).unwrap_or_default());
        Ok(())
    }

    /// Open, target (manual address or discovery) and go live
    pub async fn connect(&self, target: Option<SocketAddr>, cidr: Option<Cidr>) -> Result<SocketAddr> {
        self.open()?;
        let target = match target {
            Some(target) => {
                self.set_target(target);
                target
            }
            None => self.discover(cidr).await?,
        };
        self.go_live()?;
        Ok(target)
    }

    /// Tear the socket down and come back up against the same mixer. Waits
    /// for the old socket to be released so a fixed local port can be bound
    /// again.
    pub async fn reconnect(&self) -> Result<()> {
        let target = self.transport.target().ok_or(OscError::NoTargetConfigured)?;
        info!("🔄 Reconnecting to {}", target);

        self.stop_keepalive();
        self.transport.shutdown().await;
        self.set_state(SessionState::Idle);
        self.mute_sent.lock().clear();
        self.throttle.reset();
        self.meters.clear();

        self.open()?;
        self.set_target(target);
        self.go_live()
    }

    /// Stop keep-alive and release the socket (`→ Idle`)
    pub fn close(&self) {
        self.stop_keepalive();
        self.transport.close();
        self.set_state(SessionState::Idle);
    }

    // ===== Keep-alive and subscriptions =====

    /// Send `/xremote` now and every keep-alive period. No-op if running.
    pub fn start_keepalive(&self) -> Result<()> {
        let mut task = self.keepalive_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        self.transport.send_message(&address::xremote())?;

        let transport = Arc::clone(&self.transport);
        let period = self.config.keepalive;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                match transport.send_message(&address::xremote()) {
                    Ok(()) => trace!("Keep-alive sent"),
                    Err(e) => warn!("Keep-alive failed: {}", e),
                }
            }
        }));
        debug!("Keep-alive every {:?}", period);
        Ok(())
    }

    pub fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
            debug!("Keep-alive stopped");
        }
    }

    pub fn is_keepalive_running(&self) -> bool {
        self.keepalive_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Subscribe to the channel and stereo-bus meter banks
    pub fn subscribe_meters(&self) -> Result<()> {
        for bank in [MeterBank::Channels, MeterBank::StereoBus] {
            self.transport
                .send_message(&address::subscribe_meters(bank.address()))?;
        }
        Ok(())
    }

    pub fn query_info(&self) -> Result<()> {
        self.transport.send_message(&address::xinfo())
    }

    /// Query fader and mute of every tracked channel and the main bus
    pub fn sync_all(&self) -> Result<()> {
        let strips: Vec<Strip> = self.mixer.read().strips().map(|(s, _)| s).collect();
        for strip in &strips {
            self.transport.send_message(&address::query(strip.fader_path()))?;
            self.transport.send_message(&address::query(strip.mute_path()))?;
        }
        debug!("Sync queried {} strips", strips.len());
        Ok(())
    }

    /// Send an arbitrary message to the mixer
    pub fn send(&self, msg: &OscMessage) -> Result<()> {
        self.transport.send_message(msg)
    }

    // ===== Parameters =====

    /// Send a fader value immediately (bypasses the throttle)
    pub fn set_fader(&self, strip: Strip, value: f32) -> Result<()> {
        let value = clamp_unit(value);
        self.transport.send_message(&address::set_fader(strip, value))?;
        self.mixer.write().set_fader(strip, value);
        Ok(())
    }

    pub fn set_channel_fader(&self, ch: i32, value: f32) -> Result<()> {
        self.set_fader(Strip::channel(ch), value)
    }

    pub fn set_main_fader(&self, value: f32) -> Result<()> {
        self.set_fader(Strip::MainLr, value)
    }

    /// Send a mute change unless the same `on` value was already sent.
    /// Returns whether a message went out.
    pub fn set_mute(&self, strip: Strip, muted: bool) -> Result<bool> {
        let on = !muted;
        let mut sent = self.mute_sent.lock();
        if sent.get(&strip) == Some(&on) {
            return Ok(false);
        }
        self.transport.send_message(&address::set_mute(strip, muted))?;
        sent.insert(strip, on);
        drop(sent);

        self.mixer.write().set_muted(strip, muted);
        Ok(true)
    }

    pub fn set_channel_mute(&self, ch: i32, muted: bool) -> Result<bool> {
        self.set_mute(Strip::channel(ch), muted)
    }

    pub fn set_main_mute(&self, muted: bool) -> Result<bool> {
        self.set_mute(Strip::MainLr, muted)
    }

    pub fn channel_fader(&self, ch: i32) -> Option<f32> {
        self.mixer.read().fader(Strip::channel(ch))
    }

    pub fn channel_muted(&self, ch: i32) -> Option<bool> {
        self.mixer.read().muted(Strip::channel(ch))
    }

    pub fn main_fader(&self) -> Option<f32> {
        self.mixer.read().fader(Strip::MainLr)
    }

    pub fn main_muted(&self) -> Option<bool> {
        self.mixer.read().muted(Strip::MainLr)
    }

    /// Fader movement during a gesture; goes through the throttle
    pub fn fader_intent(&self, strip: Strip, value: f32) -> bool {
        self.throttle.intend(strip, value)
    }

    /// End of gesture; flushes the final value
    pub fn fader_release(&self, strip: Strip) -> Option<f32> {
        self.throttle.release(strip)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop_keepalive();
        self.transport.close();
    }
}
