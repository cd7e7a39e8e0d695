//! REPL – Read-Eval-Print Loop for the SweepTrack interactive shell.
//!
//! Supported slash-commands:
//!   /help              – show this list
//!   /devices           – list every device the registered drivers offer
//!   /open <id>         – open a device and start its poll loop
//!   /close <id>        – stop and forget an open device
//!   /pose <id>         – print the latest pose sample
//!   /watch <id> [n]    – stream the next `n` published samples (default 10)
//!   /props <id>        – dump every property the device answers
//!   /buttons <id>      – latest controller button state
//!   /stale             – open devices without a recent pose
//!   /schema            – JSON Schema of the calibration payload
//!   /quit | /exit      – close all devices and exit

use colored::Colorize;
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sweeptrack_runtime::{DeviceRegistry, FloatProperty, IntProperty, PoseHealth};
use sweeptrack_types::{CalibrationConfig, PoseSample, PropertyError};

const DEFAULT_WATCH_COUNT: usize = 10;
const WATCH_POLL: Duration = Duration::from_millis(5);
const WATCH_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Devices,
    Open(String),
    Close(String),
    Pose(String),
    Watch { id: String, count: usize },
    Props(String),
    Buttons(String),
    Stale,
    Schema,
    Quit,
}

/// Parse one input line.  The error is a user-facing message.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Err("empty command".to_string());
    };
    let id = |words: &mut std::str::SplitWhitespace<'_>| {
        words
            .next()
            .map(str::to_string)
            .ok_or_else(|| format!("usage: {cmd} <device-id>"))
    };

    let command = match cmd {
        "/help" => Command::Help,
        "/devices" => Command::Devices,
        "/open" => Command::Open(id(&mut words)?),
        "/close" => Command::Close(id(&mut words)?),
        "/pose" => Command::Pose(id(&mut words)?),
        "/watch" => {
            let id = id(&mut words)?;
            let count = match words.next() {
                Some(n) => n
                    .parse::<usize>()
                    .map_err(|_| format!("'{n}' is not a sample count"))?,
                None => DEFAULT_WATCH_COUNT,
            };
            Command::Watch { id, count }
        }
        "/props" => Command::Props(id(&mut words)?),
        "/buttons" => Command::Buttons(id(&mut words)?),
        "/stale" => Command::Stale,
        "/schema" => Command::Schema,
        "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(command)
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(registry: Arc<Mutex<DeviceRegistry>>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "sweeptrack>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Devices) => cmd_devices(&registry.lock()),
            Ok(Command::Open(id)) => cmd_open(&mut registry.lock(), &id),
            Ok(Command::Close(id)) => cmd_close(&mut registry.lock(), &id),
            Ok(Command::Pose(id)) => cmd_pose(&registry.lock(), &id),
            Ok(Command::Watch { id, count }) => cmd_watch(&registry, &id, count),
            Ok(Command::Props(id)) => cmd_props(&registry.lock(), &id),
            Ok(Command::Buttons(id)) => cmd_buttons(&registry.lock(), &id),
            Ok(Command::Stale) => cmd_stale(&registry.lock()),
            Ok(Command::Schema) => cmd_schema(),
            Ok(Command::Quit) => {
                registry.lock().close_all();
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(msg) => {
                println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    msg.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "SweepTrack Commands".bold().underline());
    println!("  {}          – list available devices", "/devices".bold().cyan());
    println!("  {}        – open a device", "/open <id>".bold().cyan());
    println!("  {}       – close a device", "/close <id>".bold().cyan());
    println!("  {}        – latest pose sample", "/pose <id>".bold().cyan());
    println!("  {}  – stream published samples", "/watch <id> [n]".bold().cyan());
    println!("  {}       – dump device properties", "/props <id>".bold().cyan());
    println!("  {}     – controller button state", "/buttons <id>".bold().cyan());
    println!("  {}            – devices without a recent pose", "/stale".bold().cyan());
    println!("  {}           – calibration payload JSON Schema", "/schema".bold().cyan());
    println!("  {}      – close all devices and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_devices(registry: &DeviceRegistry) {
    let devices = registry.list_devices();
    if devices.is_empty() {
        println!("  {}", "No devices available.".dimmed());
        return;
    }
    println!("{}", "Devices".bold().underline());
    for d in devices {
        let status = match registry.device(&d.id) {
            Some(dev) => format!("{:?}", dev.poll_state()).green(),
            None => "closed".dimmed(),
        };
        println!(
            "  {:<10} {:<11} {} / {} [{}]  {}",
            d.id.bold(),
            d.class.to_string(),
            d.vendor,
            d.product,
            d.driver.dimmed(),
            status
        );
    }
}

fn cmd_open(registry: &mut DeviceRegistry, id: &str) {
    match registry.open_device(id) {
        Ok(device) => {
            let mut caps: Vec<String> = device
                .capabilities()
                .iter()
                .map(|c| format!("{c:?}"))
                .collect();
            caps.sort();
            println!(
                "{} {} ({} sensors; {})",
                "✓ Opened".green(),
                id.bold(),
                device.calibration().model_points().len(),
                caps.join(", ")
            );
        }
        Err(e) => println!("{}: {}", "Open failed".red(), e),
    }
}

fn cmd_close(registry: &mut DeviceRegistry, id: &str) {
    if registry.close_device(id) {
        println!("{} {}", "✓ Closed".green(), id.bold());
    } else {
        println!("{} '{}' is not open", "Error:".red(), id.yellow());
    }
}

fn cmd_pose(registry: &DeviceRegistry, id: &str) {
    match registry.get_pose(id) {
        Ok(sample) => println!("  {}", format_sample(&sample)),
        Err(e) => println!("{}: {}", "Query failed".red(), e),
    }
}

fn cmd_watch(registry: &Mutex<DeviceRegistry>, id: &str, count: usize) {
    let mut reader = match registry.lock().reader(id) {
        Ok(r) => r,
        Err(e) => {
            println!("{}: {}", "Query failed".red(), e);
            return;
        }
    };

    let mut seen = 0;
    let mut last_update = Instant::now();
    while seen < count {
        match reader.snapshot_if_updated() {
            Some(sample) => {
                seen += 1;
                last_update = Instant::now();
                println!(
                    "  {} {}",
                    chrono::Local::now().format("%H:%M:%S%.3f").to_string().dimmed(),
                    format_sample(&sample)
                );
            }
            None if last_update.elapsed() > WATCH_TIMEOUT => {
                println!("  {}", "No new samples; giving up.".yellow());
                break;
            }
            None => std::thread::sleep(WATCH_POLL),
        }
    }
}

fn cmd_props(registry: &DeviceRegistry, id: &str) {
    let Some(device) = registry.device(id) else {
        println!("{}: {}", "Query failed".red(), PropertyError::UnknownDevice(id.to_string()));
        return;
    };

    println!("{}", format!("Properties of {id}").bold().underline());
    for kind in FloatProperty::ALL {
        let mut buf = vec![0.0f32; kind.len()];
        match device.float_property(kind, &mut buf) {
            Ok(n) => {
                let values: Vec<String> = buf[..n].iter().map(|v| format!("{v:.4}")).collect();
                println!("  {:<28} [{}]", kind.to_string(), values.join(", "));
            }
            Err(PropertyError::Unsupported { .. }) => {
                println!("  {:<28} {}", kind.to_string(), "unsupported".dimmed())
            }
            Err(e) => println!("  {:<28} {}", kind.to_string(), e.to_string().red()),
        }
    }
    for kind in IntProperty::ALL {
        let mut buf = [0i32; 1];
        match device.int_property(kind, &mut buf) {
            Ok(_) => println!("  {:<28} {}", kind.to_string(), buf[0]),
            Err(PropertyError::Unsupported { .. }) => {
                println!("  {:<28} {}", kind.to_string(), "unsupported".dimmed())
            }
            Err(e) => println!("  {:<28} {}", kind.to_string(), e.to_string().red()),
        }
    }
    let stale_after = registry.config().stale_after();
    let health = match device.health(stale_after) {
        PoseHealth::Fresh => "fresh".green(),
        PoseHealth::Stale => "stale".yellow(),
        PoseHealth::NeverPublished => "never published".dimmed(),
    };
    println!("  {:<28} {}", "health", health);
}

fn cmd_buttons(registry: &DeviceRegistry, id: &str) {
    match registry.controller_state(id) {
        Ok(Some(state)) => println!(
            "  pressed {:#06b}  touched {:#06b}  changed {:#06b}/{:#06b}  packet {}",
            state.pressed, state.touched, state.changed_pressed, state.changed_touched, state.packet
        ),
        Ok(None) => println!("  {}", "No button report yet.".dimmed()),
        Err(e) => println!("{}: {}", "Query failed".red(), e),
    }
}

fn cmd_stale(registry: &DeviceRegistry) {
    let stale_after = registry.config().stale_after();
    let stale = registry.stale_devices(stale_after);
    if stale.is_empty() {
        println!("  {}", "All open devices are fresh.".green());
    } else {
        println!(
            "  {} (older than {} ms): {}",
            "Stale".yellow(),
            stale_after.as_millis(),
            stale.join(", ")
        );
    }
}

fn cmd_schema() {
    let schema = schemars::schema_for!(CalibrationConfig);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => println!("{json}"),
        Err(e) => println!("{}: {}", "Schema error".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn format_sample(s: &PoseSample) -> String {
    let flag = if s.valid { "valid".green() } else { "invalid".red() };
    let [qx, qy, qz, qw] = s.orientation.to_xyzw();
    format!(
        "t={:>9.3}  pos=({:+.3}, {:+.3}, {:+.3})  quat=({:+.3}, {:+.3}, {:+.3}, {:+.3})  {:?} {}",
        s.timestamp,
        s.position.x,
        s.position.y,
        s.position.z,
        qx,
        qy,
        qz,
        qw,
        s.tracking_result,
        flag
    )
}
