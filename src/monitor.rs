//! Terminal output: live event monitor and the REPL's reports

use chrono::Local;
use colored::*;
use std::time::{Duration, Instant};

use xair_remote::discovery::LocalNetwork;
use xair_remote::osc::OscMessageExt;
use xair_remote::meters::MeterSnapshot;
use xair_remote::session::{MixerEvent, MixerState, SessionState};

/// Width of a meter bar in characters
const BAR_WIDTH: usize = 24;

/// Meter lines are rate-limited; the mixer pushes them every ~50 ms
const METER_PRINT_INTERVAL: Duration = Duration::from_secs(1);

fn bar(level: f32) -> String {
    let filled = ((level.clamp(0.0, 1.0) * BAR_WIDTH as f32).round()) as usize;
    format!("{}{}", "█".repeat(filled), "·".repeat(BAR_WIDTH - filled))
}

fn colored_bar(level: f32) -> ColoredString {
    let text = bar(level);
    if level >= 0.95 {
        text.red()
    } else if level >= 0.8 {
        text.yellow()
    } else {
        text.green()
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Prints inbound events as they arrive
pub struct Monitor {
    last_meter_print: Option<Instant>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            last_meter_print: None,
        }
    }

    pub fn print_header(&self) {
        println!("\n{}", "=== Mixer Monitor ===".bold().cyan());
        println!("{}", "Format: [time] KIND | DETAILS".dimmed());
        println!("{}\n", "─".repeat(80).dimmed());
    }

    pub fn format_event(&self, event: &MixerEvent) -> String {
        let body = match event {
            MixerEvent::Message(msg) => format!("{} | {}", "OSC ".blue(), msg.display()),
            MixerEvent::Fader { strip, value } => {
                format!("{} | {} {:.3} {}", "FDR ".green(), strip, value, bar(*value).dimmed())
            }
            MixerEvent::Mute { strip, muted } => {
                let state = if *muted { "MUTED".red() } else { "on".green() };
                format!("{} | {} {}", "MUTE".yellow(), strip, state)
            }
            MixerEvent::Info(info) => format!("{} | {}", "INFO".magenta(), info),
            MixerEvent::StateChanged(state) => {
                format!("{} | session {}", "SESS".cyan(), state_label(*state))
            }
        };
        format!("{} {}", format!("[{}]", timestamp()).dimmed(), body)
    }

    pub fn print_event(&self, event: &MixerEvent) {
        println!("{}", self.format_event(event));
    }

    /// Peak line for the current meter cache, at most once per interval
    pub fn format_meters(&mut self, snapshot: &MeterSnapshot) -> Option<String> {
        let now = Instant::now();
        if self
            .last_meter_print
            .is_some_and(|t| now.duration_since(t) < METER_PRINT_INTERVAL)
        {
            return None;
        }
        self.last_meter_print = Some(now);

        let peak = snapshot.channels.iter().copied().fold(0.0f32, f32::max);
        let bus = snapshot.bus[0].max(snapshot.bus[1]);
        Some(format!(
            "{} {} | ch peak {} | bus {}",
            format!("[{}]", timestamp()).dimmed(),
            "MTR ".dimmed(),
            colored_bar(peak),
            colored_bar(bus)
        ))
    }

    pub fn print_meter_line(&mut self, snapshot: &MeterSnapshot) {
        if let Some(line) = self.format_meters(snapshot) {
            println!("{}", line);
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

fn state_label(state: SessionState) -> ColoredString {
    match state {
        SessionState::Live => "live".bright_green(),
        SessionState::Targeted => "targeted".yellow(),
        SessionState::Bound => "bound".yellow(),
        SessionState::Idle => "idle".dimmed(),
    }
}

pub fn print_meters(snapshot: &MeterSnapshot) {
    println!("\n{}", "Meters:".bold());
    for (idx, level) in snapshot.channels.iter().enumerate() {
        println!("  ch{:02} {} {:.2}", idx + 1, colored_bar(*level), level);
    }
    println!("  L    {} {:.2}", colored_bar(snapshot.bus[0]), snapshot.bus[0]);
    println!("  R    {} {:.2}", colored_bar(snapshot.bus[1]), snapshot.bus[1]);
    println!();
}

pub fn print_state(state: &MixerState) {
    println!("\n{}", "Mixer state:".bold());
    for (strip, s) in state.strips() {
        let fader = s
            .fader
            .map(|v| format!("{:.3}", v))
            .unwrap_or_else(|| "?".to_string());
        let mute = match s.muted {
            Some(true) => "MUTED".red(),
            Some(false) => "on".green(),
            None => "?".dimmed(),
        };
        println!("  {:<5} fader {:>5}  {}", strip.to_string(), fader, mute);
    }
    println!();
}

/// Scan ranges `--list-interfaces` reports
pub fn print_interfaces(networks: &[LocalNetwork], max_hosts: u64) {
    println!("\n{}", "=== Local IPv4 Networks ===".bold().cyan());
    if networks.is_empty() {
        println!("  {}", "No usable interfaces found".dimmed());
    }
    for net in networks {
        let marker = if net.cidr.host_count() > max_hosts {
            "[SKIPPED]".yellow()
        } else {
            "[SCAN]".green()
        };
        let broadcast = net
            .broadcast
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<12} {:<18} hosts {:>6}  broadcast {}",
            marker,
            net.interface,
            net.cidr.to_string(),
            net.cidr.host_count(),
            broadcast
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use xair_remote::osc::Strip;

    #[test]
    fn test_bar_width() {
        assert_eq!(bar(0.0).chars().count(), BAR_WIDTH);
        assert_eq!(bar(1.0), "█".repeat(BAR_WIDTH));
        assert_eq!(bar(2.0), "█".repeat(BAR_WIDTH));
        assert_eq!(bar(0.5).chars().filter(|c| *c == '█').count(), BAR_WIDTH / 2);
    }

    #[test]
    fn test_meter_lines_are_rate_limited() {
        let mut monitor = Monitor::new();
        let snapshot = MeterSnapshot {
            channels: vec![0.5; 8],
            bus: [0.25, 0.75],
        };
        let line = monitor.format_meters(&snapshot).unwrap();
        assert!(line.contains("MTR"));
        assert!(monitor.format_meters(&snapshot).is_none());

        let fader = MixerEvent::Fader {
            strip: Strip::Channel(1),
            value: 0.25,
        };
        assert!(monitor.format_event(&fader).contains("ch01"));
    }
}
