//! Command-line interface and REPL
//!
//! The REPL runs on its own OS thread (rustyline blocks) and hands parsed
//! commands to the main loop over a channel.

use anyhow::{bail, Context, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::time::Duration;
use tokio::sync::mpsc;

use xair_remote::osc::address::MAX_CHANNEL;
use xair_remote::osc::Strip;

const DEFAULT_SWEEP: Duration = Duration::from_millis(1000);

pub const HELP: &str = "\
Commands:
  fader <ch|lr> <0..1>               set a fader immediately
  mute <ch|lr> <on|off>              mute or unmute a strip
  sweep <ch|lr> <from> <to> [ms]     move a fader as a throttled gesture
  sync                               query all tracked faders and mutes
  info                               ask the mixer to identify itself
  meters                             show current meter levels
  state                              show the mirrored mixer state
  reconnect                          rebind the socket and go live again
  help                               this text
  quit                               exit";

/// A parsed REPL line
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Fader { strip: Strip, value: f32 },
    Mute { strip: Strip, muted: bool },
    Sweep {
        strip: Strip,
        from: f32,
        to: f32,
        duration: Duration,
    },
    Sync,
    Info,
    Meters,
    State,
    Reconnect,
    Help,
    Quit,
}

fn parse_strip(token: Option<&str>) -> Result<Strip> {
    let token = token.context("missing strip (channel number or 'lr')")?;
    if token.eq_ignore_ascii_case("lr") || token.eq_ignore_ascii_case("main") {
        return Ok(Strip::MainLr);
    }
    let ch: u8 = token
        .parse()
        .with_context(|| format!("invalid strip '{}'", token))?;
    if !(1..=MAX_CHANNEL).contains(&ch) {
        bail!("channel must be 1..{}", MAX_CHANNEL);
    }
    Ok(Strip::Channel(ch))
}

fn parse_level(token: Option<&str>) -> Result<f32> {
    let token = token.context("missing value")?;
    let value: f32 = token
        .parse()
        .with_context(|| format!("invalid value '{}'", token))?;
    if !(0.0..=1.0).contains(&value) {
        bail!("value must be between 0 and 1");
    }
    Ok(value)
}

/// Parse one line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ReplCommand>> {
    let mut tokens = line.split_whitespace();
    let Some(verb) = tokens.next() else {
        return Ok(None);
    };

    let cmd = match verb.to_ascii_lowercase().as_str() {
        "fader" | "f" => ReplCommand::Fader {
            strip: parse_strip(tokens.next())?,
            value: parse_level(tokens.next())?,
        },
        "mute" | "m" => {
            let strip = parse_strip(tokens.next())?;
            let muted = match tokens.next() {
                Some("on") | Some("1") | Some("true") => true,
                Some("off") | Some("0") | Some("false") => false,
                Some(other) => bail!("expected on/off, got '{}'", other),
                None => bail!("missing on/off"),
            };
            ReplCommand::Mute { strip, muted }
        }
        "sweep" => {
            let strip = parse_strip(tokens.next())?;
            let from = parse_level(tokens.next())?;
            let to = parse_level(tokens.next())?;
            let duration = match tokens.next() {
                Some(ms) => Duration::from_millis(
                    ms.parse()
                        .with_context(|| format!("invalid duration '{}'", ms))?,
                ),
                None => DEFAULT_SWEEP,
            };
            ReplCommand::Sweep {
                strip,
                from,
                to,
                duration,
            }
        }
        "sync" => ReplCommand::Sync,
        "info" => ReplCommand::Info,
        "meters" => ReplCommand::Meters,
        "state" => ReplCommand::State,
        "reconnect" => ReplCommand::Reconnect,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" | "q" => ReplCommand::Quit,
        other => bail!("unknown command '{}' (try 'help')", other),
    };

    if let Some(extra) = tokens.next() {
        bail!("unexpected argument '{}'", extra);
    }
    Ok(Some(cmd))
}

/// Run the line editor on a dedicated thread. Ends on `quit`, Ctrl+C or
/// Ctrl+D (both of which also send `Quit`), or when the receiver is gone.
pub fn spawn_repl(tx: mpsc::Sender<ReplCommand>) -> Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("repl".to_string())
        .spawn(move || {
            let mut rl = match DefaultEditor::new() {
                Ok(rl) => rl,
                Err(e) => {
                    eprintln!("{} {}", "cannot start line editor:".red(), e);
                    let _ = tx.blocking_send(ReplCommand::Quit);
                    return;
                }
            };
            repl_loop(&mut rl, &tx);
        })?;

    Ok(handle)
}

fn repl_loop(rl: &mut DefaultEditor, tx: &mpsc::Sender<ReplCommand>) {
    loop {
        let line = match rl.readline("xair> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                let _ = tx.blocking_send(ReplCommand::Quit);
                break;
            }
            Err(e) => {
                eprintln!("{} {}", "readline error:".red(), e);
                let _ = tx.blocking_send(ReplCommand::Quit);
                break;
            }
        };

        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(cmd)) => {
                let _ = rl.add_history_entry(line.as_str());
                let quit = cmd == ReplCommand::Quit;
                if tx.blocking_send(cmd).is_err() || quit {
                    break;
                }
            }
            Err(e) => println!("{} {:#}", "error:".red(), e),
        }
    }
}
