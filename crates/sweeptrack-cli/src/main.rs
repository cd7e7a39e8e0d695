//! `sweeptrack-cli` – SweepTrack command line interface.
//!
//! This binary:
//!
//! 1. Initialises tracing (optionally exporting spans over OTLP).
//! 2. Loads `~/.sweeptrack/config.toml`, writing a default configuration
//!    describing a simulated HMD and controller on first run.
//! 3. Registers the simulator driver with a [`DeviceRegistry`].
//! 4. Drops the user into an interactive REPL with slash-commands.
//! 5. Intercepts **Ctrl-C** to close every open device before exiting.

mod config;
mod repl;

use colored::Colorize;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use sweeptrack_runtime::{DeviceRegistry, telemetry};

fn main() {
    let _telemetry = telemetry::init_tracing("sweeptrack");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let mut registry = DeviceRegistry::new(cfg.runtime.clone());
    match cfg.sim_driver() {
        Ok(driver) => registry.register_driver(Box::new(driver)),
        Err(e) => println!("{}: {}", "Simulator config error".red(), e),
    }
    info!(devices = registry.list_devices().len(), "Registry ready");
    let registry = Arc::new(Mutex::new(registry));

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let registry_ctrlc = registry.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – closing devices …".yellow().bold());
        registry_ctrlc.lock().close_all();
        println!("{}", "  ✓ All devices closed.".green());
        shutdown_clone.store(true, Ordering::SeqCst);
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; devices will not be closed on Ctrl-C");
    }

    println!();
    println!(
        "  {} device(s) available. Type {} for a list of commands.\n",
        registry.lock().list_devices().len(),
        "/help".bold().cyan()
    );

    repl::run(registry.clone(), shutdown);
    registry.lock().close_all();
}

// ─────────────────────────────────────────────────────────────────────────────
// First run
// ─────────────────────────────────────────────────────────────────────────────

fn first_run() -> config::Config {
    println!();
    println!("  No configuration found.  Writing defaults (simulated HMD + controller).");

    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____                      _____              _    "#.bold().cyan());
    println!("{}", r#"  / ___|_      _____  ___ _|_   _| __ __ _  ___| | __"#.bold().cyan());
    println!("{}", r#"  \___ \ \ /\ / / _ \/ _ \ '_ \| || '__/ _` |/ __| |/ /"#.bold().cyan());
    println!("{}", r#"   ___) \ V  V /  __/  __/ |_) | || | | (_| | (__|   < "#.bold().cyan());
    println!("{}", r#"  |____/ \_/\_/ \___|\___| .__/|_||_|  \__,_|\___|_|\_\"#.bold().cyan());
    println!("{}", r#"                         |_|                          "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "SweepTrack".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Lighthouse-style optical pose tracking");
    println!();
}
