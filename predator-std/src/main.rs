//! Predator — std driver
//!
//! Runs the passive opener on a single scan thread driven by a fixed tick,
//! with std::sync::mpsc channels to the console threads. Commands arrive as
//! NDJSON on stdin; dispatches and status reports leave as NDJSON on stdout.
//! Logs go to stderr.

mod config;
mod radio;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use predator::comm::{self, CommandEffect, LineReader, STATUS_INTERVAL_SECS};
use predator::compliance::{Region, REGION_FILE_NAME};
use predator::models::{CarModelDispatch, ProtocolClass};
use predator::passive::{PassiveScanCycle, TickOutcome};
use predator::protocol::{DeviceMessage, HostCommand, MsgBuffer, VERSION};
use predator::{board, subghz};

use radio::SimulatedRadio;

#[derive(Parser, Debug)]
#[command(name = "predator-std")]
#[command(version)]
#[command(about = "Passive opener scan loop with an NDJSON console", long_about = None)]
struct Args {
    /// One-line file holding the 2-letter region code
    #[arg(long, default_value = REGION_FILE_NAME)]
    region_file: PathBuf,

    /// Tick period in milliseconds
    #[arg(long, default_value_t = subghz::TICK_PERIOD_MS)]
    tick_ms: u64,

    /// Run without a radio (demo mode only)
    #[arg(long)]
    no_radio: bool,

    /// Start the passive opener without waiting for a start command
    #[arg(long)]
    autostart: bool,

    /// Exit after this many ticks instead of running until interrupted
    #[arg(long)]
    ticks: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Everything the scan thread owns.
struct ScanContext {
    cycle: PassiveScanCycle<SimulatedRadio>,
    region: Region,
    region_file: PathBuf,
    tick: Duration,
    tick_limit: Option<u64>,
    status_interval: Duration,
    boot: Instant,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "predator=debug,predator_std=debug"
    } else {
        "predator=info,predator_std=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let boot = Instant::now();

    log::info!("Predator v{} starting on {} (std)", VERSION, board::BOARD_NAME);

    let dispatch = CarModelDispatch::builtin();
    log::info!(
        "Dispatch table loaded: {} models ({} fixed, {} rolling, {} challenge-response)",
        dispatch.len(),
        dispatch.count_by_class(ProtocolClass::Fixed),
        dispatch.count_by_class(ProtocolClass::Rolling),
        dispatch.count_by_class(ProtocolClass::ChallengeResponse),
    );

    let mut freqs = heapless::Vec::<heapless::String<16>, 3>::new();
    for &hz in &subghz::PASSIVE_FREQUENCIES {
        let mut s = heapless::String::new();
        subghz::format_frequency(hz, &mut s);
        let _ = freqs.push(s);
    }
    log::info!(
        "SubGHz front end: {} CC1101, {} dBm, passive carriers {:?}",
        if board::HAS_EXTERNAL_CC1101 { "external" } else { "internal" },
        board::TX_POWER_DBM,
        freqs,
    );

    let region = config::load_region(&args.region_file)?;

    let radio_present = !args.no_radio && board::has_subghz();
    if !radio_present {
        log::warn!("No SubGHz radio, passive opener limited to demo mode");
    }
    let cycle = PassiveScanCycle::new(dispatch, SimulatedRadio::new(radio_present));

    // ── Channels ─────────────────────────────────────────────────────

    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);
    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(8);

    // ── Output thread ────────────────────────────────────────────────

    let output = thread::Builder::new()
        .name("output".into())
        .spawn(move || {
            output_thread(output_rx);
        })?;
    log::info!("Output thread spawned");

    // ── Command thread ───────────────────────────────────────────────

    thread::Builder::new()
        .name("command".into())
        .spawn(move || {
            command_thread(cmd_tx);
        })?;
    log::info!("Command thread spawned");

    // ── Scan loop — runs on main thread ──────────────────────────────

    let mut ctx = ScanContext {
        cycle,
        region,
        region_file: args.region_file,
        tick: Duration::from_millis(args.tick_ms.max(1)),
        tick_limit: args.ticks,
        status_interval: Duration::from_secs(STATUS_INTERVAL_SECS),
        boot,
    };

    if args.autostart {
        apply_command(&mut ctx, HostCommand::Start, &output_tx);
    }

    scan_loop(&mut ctx, cmd_rx, &output_tx);

    let ScanContext { cycle, .. } = ctx;
    let stats = cycle.stats();
    let radio = cycle.into_radio();
    log::info!(
        "Shutting down: {} cars attempted, {} sent, {} demo, {} failed, {} bursts keyed",
        stats.cars_attempted,
        stats.transmissions_sent,
        stats.demo_dispatches,
        stats.transmit_failures,
        radio.transmissions()
    );

    // Let the output thread drain before exiting.
    drop(output_tx);
    let _ = output.join();
    Ok(())
}

// ── Scan loop ────────────────────────────────────────────────────────

/// Single cooperative loop: commands and ticks are handled on this thread
/// only. Once the command channel closes the loop keeps ticking on a plain
/// sleep, and returns when the cycle is not running or the tick limit is hit.
fn scan_loop(
    ctx: &mut ScanContext,
    cmd_rx: mpsc::Receiver<HostCommand>,
    output_tx: &SyncSender<MsgBuffer>,
) {
    let mut ticks: u64 = 0;
    let mut next_tick = Instant::now() + ctx.tick;
    let mut last_status = Instant::now();
    let mut commands_open = true;

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());

        if commands_open {
            match cmd_rx.recv_timeout(timeout) {
                Ok(cmd) => {
                    apply_command(ctx, cmd, output_tx);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    commands_open = false;
                    if !ctx.cycle.is_running() {
                        log::info!("Command input closed");
                        break;
                    }
                    log::info!("Command input closed, scan continues until interrupted");
                    continue;
                }
            }
        } else {
            if !ctx.cycle.is_running() {
                break;
            }
            thread::sleep(timeout);
        }

        next_tick += ctx.tick;

        if let TickOutcome::Dispatched(d) = ctx.cycle.tick() {
            let n = ctx.cycle.state().cars_attempted;
            let msg = comm::dispatch_message(&d, n, uptime_millis(ctx.boot));
            send(output_tx, &msg);
        }

        if last_status.elapsed() >= ctx.status_interval {
            send_status(ctx, output_tx);
            last_status = Instant::now();
        }

        ticks += 1;
        if ctx.tick_limit.is_some_and(|limit| ticks >= limit) {
            log::info!("Tick limit of {} reached", ticks);
            break;
        }
    }
}

fn apply_command(ctx: &mut ScanContext, cmd: HostCommand, output_tx: &SyncSender<MsgBuffer>) {
    match comm::handle_command(cmd, &mut ctx.cycle, &mut ctx.region) {
        CommandEffect::None => {}
        CommandEffect::SendStatus => send_status(ctx, output_tx),
        CommandEffect::RegionChanged(region) => {
            if let Err(e) = config::save_region(&ctx.region_file, region) {
                log::error!("{:#}", e);
            }
        }
    }
}

fn send_status(ctx: &ScanContext, output_tx: &SyncSender<MsgBuffer>) {
    let uptime = ctx.boot.elapsed().as_secs() as u32;
    let msg = comm::status_message(&ctx.cycle, ctx.region, uptime);
    send(output_tx, &msg);
}

/// Serialize and queue a message. Drops it if the output thread is behind.
fn send(output_tx: &SyncSender<MsgBuffer>, msg: &DeviceMessage) {
    match comm::encode_message(msg) {
        Some(buf) => {
            let _ = output_tx.try_send(buf);
        }
        None => log::warn!("Message did not fit the output buffer"),
    }
}

fn uptime_millis(boot: Instant) -> u32 {
    (boot.elapsed().as_millis() & 0xFFFF_FFFF) as u32
}

// ── Output thread ────────────────────────────────────────────────────

fn output_thread(output_rx: mpsc::Receiver<MsgBuffer>) {
    let stdout = std::io::stdout();
    while let Ok(msg) = output_rx.recv() {
        let mut out = stdout.lock();
        if out.write_all(&msg).and_then(|_| out.flush()).is_err() {
            log::error!("stdout closed, dropping output");
            return;
        }
    }
}

// ── Command thread ───────────────────────────────────────────────────

fn command_thread(cmd_tx: SyncSender<HostCommand>) {
    let mut reader = LineReader::new();
    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; 64];

    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::error!("stdin read failed: {}", e);
                break;
            }
        };
        for &byte in &buf[..n] {
            if let Some(line) = reader.feed(byte) {
                if let Some(cmd) = comm::parse_command(line) {
                    if cmd_tx.send(cmd).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &tempfile::TempDir, tick_limit: u64) -> ScanContext {
        ScanContext {
            cycle: PassiveScanCycle::new(CarModelDispatch::builtin(), SimulatedRadio::new(false)),
            region: Region::EU,
            region_file: dir.path().join(REGION_FILE_NAME),
            tick: Duration::from_millis(1),
            tick_limit: Some(tick_limit),
            status_interval: Duration::from_secs(STATUS_INTERVAL_SECS),
            boot: Instant::now(),
        }
    }

    fn drain(output_rx: &mpsc::Receiver<MsgBuffer>) -> Vec<String> {
        output_rx
            .try_iter()
            .map(|buf| String::from_utf8(buf.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn autostart_keeps_ticking_after_input_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, 10);
        let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);
        let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(16);

        apply_command(&mut ctx, HostCommand::Start, &output_tx);
        drop(cmd_tx);
        scan_loop(&mut ctx, cmd_rx, &output_tx);

        assert!(ctx.cycle.is_running());
        assert_eq!(ctx.cycle.state().cars_attempted, 2);
        let lines = drain(&output_rx);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.contains(r#""type":"dispatch""#)));
    }

    #[test]
    fn closed_input_with_idle_cycle_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, 1_000_000);
        let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);
        let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(16);

        drop(cmd_tx);
        scan_loop(&mut ctx, cmd_rx, &output_tx);

        assert!(!ctx.cycle.is_running());
        assert!(drain(&output_rx).is_empty());
    }

    #[test]
    fn periodic_status_sent_while_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, 3);
        ctx.status_interval = Duration::ZERO;
        let (_cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);
        let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(16);

        scan_loop(&mut ctx, cmd_rx, &output_tx);

        let lines = drain(&output_rx);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.contains(r#""running":false"#)));
    }

    #[test]
    fn set_region_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, 1);
        let (output_tx, _output_rx) = mpsc::sync_channel::<MsgBuffer>(4);

        apply_command(&mut ctx, HostCommand::SetRegion { region: Region::JP }, &output_tx);

        assert_eq!(ctx.region, Region::JP);
        assert_eq!(config::load_region(&ctx.region_file).unwrap(), Region::JP);
    }
}
