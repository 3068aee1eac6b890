//! Line-oriented command shell.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::info;

use crate::autoeq;
use crate::bluetooth::Transport;
use crate::device::equalizer::{
    Preset, BAND_COUNT, BAND_FREQUENCIES, GAIN_MAX_DB, GAIN_MIN_DB,
};
use crate::device::{DeviceState, EqMode};
use crate::dispatcher::{Command, CommandDispatcher, Delivery, DispatchError};
use crate::protocol::codec::{decode_gain, encode_gain, q_factor};
use crate::protocol::commands::MAGIC;
use crate::protocol::{parse_hex, Frame};
use crate::session::{DisconnectIntent, Session, SessionError, SessionTiming};

const PROMPT: &str = "fairbuds> ";

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Unknown command: {0}. Type 'help' for available commands.")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid value: {0}")]
    BadValue(String),
}

/// Everything the operator can type.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Device(Command),
    Load(String),
    Presets,
    Show,
    Bands,
    Reconnect,
    Help,
    Quit,
}

impl ShellCommand {
    /// Commands that talk to the device need a live link.
    fn needs_link(&self) -> bool {
        matches!(self, ShellCommand::Device(_) | ShellCommand::Load(_) | ShellCommand::Show)
    }
}

fn arg<V: std::str::FromStr>(args: &[&str], idx: usize, usage: &'static str) -> Result<V, ParseError> {
    let raw = args.get(idx).ok_or(ParseError::Usage(usage))?;
    raw.parse()
        .map_err(|_| ParseError::BadValue(raw.to_string()))
}

/// Parse one input line. `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<ShellCommand>, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((name, args)) = words.split_first() else {
        return Ok(None);
    };
    let name = name.to_ascii_lowercase();

    let command = match name.as_str() {
        "main" | "bass" | "flat" | "studio" => {
            let preset = name.parse::<Preset>().map_err(ParseError::BadValue)?;
            ShellCommand::Device(Command::ApplyPreset(preset))
        }
        "preset" => {
            let id: u8 = arg(args, 0, "preset <1-4>")?;
            let preset = Preset::from_id(id)
                .ok_or_else(|| ParseError::BadValue(format!("preset {} (must be 1-4)", id)))?;
            ShellCommand::Device(Command::SelectPreset(preset))
        }
        "eq" => {
            const USAGE: &str = "eq <g0> <g1> <g2> <g3> <g4> <g5> <g6> <g7>";
            if args.len() < BAND_COUNT {
                return Err(ParseError::Usage(USAGE));
            }
            let mut gains = [0.0; BAND_COUNT];
            for (i, gain) in gains.iter_mut().enumerate() {
                *gain = arg(args, i, USAGE)?;
            }
            ShellCommand::Device(Command::SetAllGains(gains))
        }
        "gain" => ShellCommand::Device(Command::SetBandGain {
            band: arg(args, 0, "gain <band> <dB>")?,
            gain_db: arg(args, 1, "gain <band> <dB>")?,
        }),
        // Bare `q` quits; with arguments it sets a band's Q.
        "q" if args.is_empty() => ShellCommand::Quit,
        "q" => ShellCommand::Device(Command::SetBandQ {
            band: arg(args, 0, "q <band> <value>")?,
            q: arg(args, 1, "q <band> <value>")?,
        }),
        "qall" => ShellCommand::Device(Command::SetAllQ(arg(args, 0, "qall <value>")?)),
        "info" => ShellCommand::Device(Command::RequestDeviceInfo),
        "raw" => ShellCommand::Device(Command::Raw(parse_raw(args)?)),
        "load" | "l" => {
            let file = args.first().ok_or(ParseError::Usage("load <file>"))?;
            ShellCommand::Load(file.to_string())
        }
        "presets" => ShellCommand::Presets,
        "show" => ShellCommand::Show,
        "bands" => ShellCommand::Bands,
        "reconnect" => ShellCommand::Reconnect,
        "help" => ShellCommand::Help,
        "quit" | "exit" => ShellCommand::Quit,
        _ => return Err(ParseError::Unknown(name)),
    };
    Ok(Some(command))
}

/// Hex frame with or without the QXW prefix.
fn parse_raw(args: &[&str]) -> Result<Frame, ParseError> {
    if args.is_empty() {
        return Err(ParseError::Usage("raw <hex>"));
    }
    let joined = args.concat();
    let mut bytes = parse_hex(&joined).ok_or_else(|| ParseError::BadValue(joined.clone()))?;
    if !bytes.starts_with(&MAGIC) {
        bytes.splice(0..0, MAGIC);
    }
    Frame::from_bytes(&bytes).map_err(|e| ParseError::BadValue(e.to_string()))
}

pub fn print_help(presets_dir: &Path) {
    let presets = autoeq::list_presets(presets_dir);
    let available = if presets.is_empty() {
        "  (none found)".to_string()
    } else {
        format!("  Available: {}", presets.join(", "))
    };

    println!(
        "
Commands:

  PRESETS (built-in DSP modes):
    main / bass / flat   - Clear custom EQ, then switch preset
    studio               - Switch to studio, then zero custom EQ
    preset <1-4>         - Switch preset only

  CUSTOM EQ (8 bands: 60, 100, 230, 500, 1100, 2400, 5400, 12000 Hz):
    eq <g0> ... <g7>     - Set all 8 band gains
    gain <band> <dB>     - Set one band gain ({:+.1} to {:+.1} dB nominal)
    load/l <file>        - Load AutoEQ parametric EQ file (.txt optional)
    presets              - List preset files
{}

  Q-FACTOR:
    q <band> <value>     - Set Q for one band (Q = value/10)
    qall <value>         - Set Q for all bands

  INFO:
    show                 - Show current EQ settings
    bands                - Show band frequencies
    info                 - Request battery and name

  CONNECTION / DEBUG:
    reconnect            - Reconnect after link loss
    raw <hex>            - Send a raw QXW frame

  help / quit

Gain: byte = dB*10 + 120 (0 = -12 dB, 120 = 0 dB, 255 = +13.5 dB)
",
        GAIN_MIN_DB, GAIN_MAX_DB, available
    );
}

pub fn print_presets(presets_dir: &Path) {
    let presets = autoeq::list_presets(presets_dir);
    if presets.is_empty() {
        println!("No presets found in {}", presets_dir.display());
        return;
    }
    println!("Available presets in {}:", presets_dir.display());
    for name in presets {
        println!("  {}", name);
    }
}

fn print_bands() {
    println!("Band frequencies:");
    for (i, freq) in BAND_FREQUENCIES.iter().enumerate() {
        println!("  Band {}: {:5} Hz", i, freq);
    }
}

fn print_state(state: &DeviceState) {
    let mode = match state.mode() {
        EqMode::Unknown => "unknown (nothing sent yet)".to_string(),
        EqMode::Preset(p) => format!("preset {}", p),
        EqMode::Custom => "custom EQ".to_string(),
    };
    println!("Mode: {}", mode);
    for band in state.bands() {
        let freq = band.frequency().unwrap_or_default();
        print!(
            "  Band {} ({:5} Hz): {:+5.1} dB  Q={:.1}",
            band.index,
            freq,
            band.gain_db,
            q_factor(band.q)
        );
        if !band.is_nominal() {
            print!("  (device: {:+.1} dB)", decode_gain(encode_gain(band.gain_db)));
        }
        println!();
    }
    match state.info() {
        Some(info) => println!("Device: {}", info),
        None => println!("Device: no info yet (type 'info')"),
    }
}

fn report(result: Result<Delivery, DispatchError>) {
    match result {
        Ok(Delivery::Acknowledged) => println!("Done"),
        Ok(Delivery::NoResponse) => println!("Sent (no response from device)"),
        Err(DispatchError::Session(SessionError::Disconnected)) => {
            println!("Link lost. Type 'reconnect' to try again.")
        }
        Err(e) => println!("Failed: {}", e),
    }
}

fn print_link_lost() {
    println!();
    println!("BLE link lost. Audio may keep playing but EQ control is gone.");
    println!("To recover: put the earbuds in the case, close the lid, wait 5 seconds,");
    println!("take them out, then type 'reconnect'. Or 'quit' to exit.");
}

fn prompt() -> std::io::Result<()> {
    print!("{}", PROMPT);
    std::io::stdout().flush()
}

async fn link_lost(monitor: &mut watch::Receiver<bool>) {
    if monitor.wait_for(|lost| *lost).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Tear down the current session and connect a fresh one on its transport.
async fn reconnect<T: Transport>(mut session: Session<T>, timing: SessionTiming) -> Session<T> {
    let address = session.address();
    session.disconnect(DisconnectIntent::Reconnect).await;
    let mut fresh = Session::new(session.into_transport(), address, timing);
    match fresh.connect().await {
        Ok(()) => println!("Reconnected"),
        Err(e) => {
            println!("Reconnect failed: {}", e);
            println!("Put the earbuds in the case, close the lid, wait, take them out, and retry.");
        }
    }
    fresh
}

/// Run the shell until `quit`, end of input, or Ctrl-C. The session is
/// closed on the way out.
pub async fn run<T: Transport>(
    mut session: Session<T>,
    timing: SessionTiming,
    presets_dir: PathBuf,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut monitor = session.link_monitor();
    let mut announced = false;

    print_help(&presets_dir);

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = link_lost(&mut monitor), if !announced => {
                announced = true;
                print_link_lost();
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        if command.needs_link() && !session.is_ready() {
            println!("Not connected. Type 'reconnect' to try reconnecting.");
            continue;
        }

        match command {
            ShellCommand::Quit => break,
            ShellCommand::Help => print_help(&presets_dir),
            ShellCommand::Presets => print_presets(&presets_dir),
            ShellCommand::Bands => print_bands(),
            ShellCommand::Show => print_state(session.device()),
            ShellCommand::Reconnect => {
                session = reconnect(session, timing).await;
                monitor = session.link_monitor();
                announced = false;
            }
            ShellCommand::Load(name) => {
                let path = autoeq::resolve_preset_path(&name, &presets_dir);
                println!("Loading AutoEQ file: {}", path.display());
                match autoeq::load_file(&path) {
                    Ok(bands) => {
                        let mut dispatcher = CommandDispatcher::new(&mut session);
                        report(dispatcher.dispatch(Command::SetCustomEq(bands)).await);
                    }
                    Err(e) => println!("Failed to load: {}", e),
                }
            }
            ShellCommand::Device(command) => {
                let wants_info = command == Command::RequestDeviceInfo;
                let mut dispatcher = CommandDispatcher::new(&mut session);
                report(dispatcher.dispatch(command).await);
                if wants_info {
                    if let Some(info) = dispatcher.state().info() {
                        println!("Device: {}", info);
                    }
                }
            }
        }
    }

    info!("Shell exiting");
    session.disconnect(DisconnectIntent::Close).await;
    Ok(())
}
