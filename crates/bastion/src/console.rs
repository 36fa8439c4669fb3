//! Line-oriented operator console
//!
//! Reads one command per line and drives the supervisor. Output goes to the
//! given writer; logs keep going through `tracing`.

use crate::context::AppContext;
use anyhow::Result;
use bastion_guard::{RunningState, TunnelOp};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use thiserror::Error;

const HELP: &str = "\
Commands:
  status                       Show service states
  results [--json]             Show finished scan reports
  pending                      Show queued files
  flagged                      Show files classified as threats
  scan <path>                  Queue a file for scanning
  scan-service up|down         Start or stop the scan pipeline
  watcher up|down              Start or stop the download watcher
  tunnel start|stop [peer]     Bring the VPN tunnel up or down
  guardian up|down             Start or stop the guardian loop
  protect [peer]               Tunnel, scanning, watcher and guardian in one go
  help                         Show this help
  quit                         Stop everything and exit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Expected 'up' or 'down', got '{0}'")]
    InvalidState(String),

    #[error("Unsupported tunnel operation '{0}'")]
    UnsupportedTunnelOp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Results { json: bool },
    Pending,
    Flagged,
    Scan(PathBuf),
    ScanService(RunningState),
    Watcher(RunningState),
    Tunnel { op: TunnelOp, peer: Option<String> },
    Guardian(RunningState),
    Protect(Option<String>),
    Help,
    Quit,
}

fn parse_state(word: Option<&str>) -> Result<RunningState, CommandError> {
    match word {
        Some("up") | Some("on") | Some("start") => Ok(RunningState::Up),
        Some("down") | Some("off") | Some("stop") => Ok(RunningState::Down),
        Some(other) => Err(CommandError::InvalidState(other.to_string())),
        None => Err(CommandError::MissingArgument("up|down")),
    }
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if word.is_empty() {
        return Ok(None);
    }
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    let command = match word {
        "status" => Command::Status,
        "results" => Command::Results {
            json: args.next() == Some("--json"),
        },
        "pending" => Command::Pending,
        "flagged" => Command::Flagged,
        // Paths may contain spaces; take the rest of the line
        "scan" if rest.is_empty() => return Err(CommandError::MissingArgument("path")),
        "scan" => Command::Scan(PathBuf::from(rest)),
        "scan-service" => Command::ScanService(parse_state(args.next())?),
        "watcher" => Command::Watcher(parse_state(args.next())?),
        "guardian" => Command::Guardian(parse_state(args.next())?),
        "tunnel" => {
            let op = args.next().ok_or(CommandError::MissingArgument("start|stop"))?;
            let op = op
                .parse::<TunnelOp>()
                .map_err(|_| CommandError::UnsupportedTunnelOp(op.to_string()))?;
            Command::Tunnel {
                op,
                peer: args.next().map(str::to_string),
            }
        }
        "protect" => Command::Protect(args.next().map(str::to_string)),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Execute a command. Returns `false` when the console should exit.
pub fn execute<W: Write>(ctx: &AppContext, command: Command, out: &mut W) -> Result<bool> {
    let supervisor = ctx.supervisor();

    match command {
        Command::Status => {
            writeln!(out, "tunnel:       {}", supervisor.tunnel_state())?;
            writeln!(out, "scan service: {}", supervisor.scan_state())?;
            writeln!(out, "watcher:      {}", supervisor.watcher_state())?;
            writeln!(out, "guardian:     {}", supervisor.guardian_state())?;
            let remote = if ctx.config().remote.is_usable() { "enabled" } else { "disabled" };
            writeln!(out, "remote check: {}", remote)?;
            writeln!(
                out,
                "queue:        {} pending, {} scanned",
                supervisor.pipeline().pending().len(),
                supervisor.pipeline().results().len()
            )?;
        }
        Command::Results { json } => {
            let results = supervisor.pipeline().results();
            if json {
                let reports: Vec<_> = results.iter().map(|r| r.as_ref()).collect();
                writeln!(out, "{}", serde_json::to_string_pretty(&reports)?)?;
            } else if results.is_empty() {
                writeln!(out, "No scan results yet")?;
            } else {
                for report in results {
                    writeln!(out, "{}", report)?;
                }
            }
        }
        Command::Pending => {
            for target in supervisor.pipeline().pending() {
                writeln!(out, "{}", target)?;
            }
        }
        Command::Flagged => {
            for target in supervisor.pipeline().flagged() {
                writeln!(out, "{}", target)?;
            }
        }
        Command::Scan(path) => {
            if supervisor.pipeline().submit(&path) {
                writeln!(out, "Queued {}", path.display())?;
            } else {
                writeln!(out, "Not queued: {} (missing or already queued)", path.display())?;
            }
        }
        Command::ScanService(state) => {
            let results = supervisor.set_scan_service(state);
            writeln!(out, "Scan service {} ({} results)", supervisor.scan_state(), results.len())?;
        }
        Command::Watcher(state) => {
            supervisor.set_watcher_service(state)?;
            writeln!(out, "Watcher {}", supervisor.watcher_state())?;
        }
        Command::Tunnel { op, peer } => {
            let peer = match op {
                TunnelOp::Start => ctx.resolve_peer(peer.as_deref()),
                TunnelOp::Stop => None,
            };
            supervisor.manage_tunnel(op, peer)?;
            writeln!(out, "Tunnel {}", supervisor.tunnel_state())?;
        }
        Command::Guardian(RunningState::Up) => {
            supervisor.start_guardian()?;
            writeln!(out, "Guardian {}", supervisor.guardian_state())?;
        }
        Command::Guardian(RunningState::Down) => {
            supervisor.stop_guardian();
            writeln!(out, "Guardian {}", supervisor.guardian_state())?;
        }
        Command::Protect(peer) => {
            ctx.protect(peer.as_deref())?;
            writeln!(out, "Protection active")?;
        }
        Command::Help => writeln!(out, "{}", HELP)?,
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// Read commands until `quit` or end of input
pub fn run<R: BufRead, W: Write>(ctx: &AppContext, input: R, out: &mut W) -> Result<()> {
    for line in input.lines() {
        let line = line?;
        match parse_command(&line) {
            Ok(Some(command)) => match execute(ctx, command, out) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => writeln!(out, "Error: {:#}", e)?,
            },
            Ok(None) => {}
            Err(e) => writeln!(out, "{}", e)?,
        }
        out.flush()?;
    }
    Ok(())
}
