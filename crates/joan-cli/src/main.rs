//! `joan` – JOAN experiment console
//!
//! This binary is the operator's entry point to a driving-simulator session.
//! It:
//!
//! 1. Loads `joan.toml` (or `$JOAN_CONFIG`); falls back to defaults when the
//!    file is absent or broken.
//! 2. Builds one module manager per enabled module; every module starts
//!    `Stopped`.
//! 3. Prints every state change and runs a supervisor that fails modules
//!    whose worker stalls.
//! 4. Drops the operator into an **interactive console** (`help`, `modules`,
//!    `ready all`, `run all`, `news`, …).
//! 5. Intercepts **Ctrl-C** to stop every module and exit.

mod app;
mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use app::App;
use joan_core::StateChange;
use joan_types::State;

fn main() {
    // Set JOAN_LOG_FORMAT=json for newline-delimited JSON logs.  User-facing
    // output still goes through println!.
    let _telemetry = joan_core::telemetry::init_tracing("joan");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            println!(
                "  No {} found – using defaults.",
                config::config_path().display().to_string().bold()
            );
            config::Config::default()
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let app = match App::build(&cfg) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{}: {}", "Startup failed".red().bold(), e);
            std::process::exit(1);
        }
    };
    app.on_state_change(print_state_change);

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown_ctrlc = Arc::clone(&shutdown);
    let stop_all = app.stopper();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping all modules …".yellow().bold());
        shutdown_ctrlc.store(true, Ordering::SeqCst);
        stop_all("operator interrupt");
        println!("{}", "  ✓ Exiting JOAN.".green());
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; modules will not be stopped on Ctrl-C");
    }

    // ── Watchdog supervisor ───────────────────────────────────────────────
    let supervisor = match app.spawn_supervisor(Arc::clone(&shutdown), cfg.supervisor_interval()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to start supervisor; stalled workers will go unnoticed");
            None
        }
    };

    println!();
    for manager in app.managers() {
        println!(
            "  {} {}",
            "•".cyan(),
            manager.id().display_name().bold()
        );
    }
    println!();
    println!("  Type {} for a list of commands.\n", "help".bold().cyan());

    // ── Interactive console ───────────────────────────────────────────────
    repl::run(&app, Arc::clone(&shutdown));

    shutdown.store(true, Ordering::SeqCst);
    app.stop_all("console closed");
    if let Some(handle) = supervisor
        && handle.join().is_err()
    {
        warn!("supervisor thread panicked");
    }
    println!("{}", "Goodbye.".green());
}

fn print_state_change(change: &StateChange) {
    let time = chrono::Local::now().format("%H:%M:%S%.3f");
    let reason = if change.reason.is_empty() {
        String::new()
    } else {
        format!(" ({})", change.reason)
    };
    let marker = if change.to == State::Error { "!".red().bold() } else { "→".cyan() };
    println!(
        "\r  {} {} {} {} {}{}",
        time.to_string().dimmed(),
        change.module.key().bold(),
        repl::paint(change.from),
        marker,
        repl::paint(change.to),
        reason.dimmed()
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"       _  ___    _    _   _ "#.bold().cyan());
    println!("{}", r#"      | |/ _ \  / \  | \ | |"#.bold().cyan());
    println!("{}", r#"   _  | | | | |/ _ \ |  \| |"#.bold().cyan());
    println!("{}", r#"  | |_| | |_| / ___ \| |\  |"#.bold().cyan());
    println!("{}", r#"   \___/ \___/_/   \_\_| \_|"#.bold().cyan());
    println!();
    println!("  {} {}",
        "JOAN".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Driving-simulator experiment control");
    println!();
}
