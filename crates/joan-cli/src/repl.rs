//! REPL – the operator console.
//!
//! Supported commands:
//!   help                              – show this list
//!   modules                           – list modules and their states
//!   state <module>                    – state and allowed next states
//!   idle|ready|run|stop|error <m|all> – request a transition
//!   news [module]                     – published values (all when omitted)
//!   connect | disconnect              – toggle the Carla connection
//!   quit | exit                       – stop every module and leave

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use joan_types::{JoanError, ModuleId, State};

use crate::app::{App, Target};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Modules,
    State(ModuleId),
    Transition { state: State, target: Target },
    News(Option<ModuleId>),
    Connect,
    Disconnect,
    Quit,
}

/// Parse a console line.  Returns a message suitable for the operator on
/// failure.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let arg = words.next();
    if let Some(extra) = words.next() {
        return Err(format!("unexpected argument '{extra}'"));
    }

    let module = |arg: Option<&str>| -> Result<ModuleId, String> {
        let key = arg.ok_or_else(|| format!("'{verb}' needs a module"))?;
        key.parse::<ModuleId>().map_err(|e: JoanError| e.to_string())
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "help" | "?" => Command::Help,
        "modules" | "ls" => Command::Modules,
        "state" => Command::State(module(arg)?),
        "news" => Command::News(arg.map(|a| module(Some(a))).transpose()?),
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "quit" | "exit" => Command::Quit,
        other => {
            let state = match other {
                "idle" => State::Idle,
                "ready" => State::Ready,
                "run" | "start" => State::Running,
                "stop" => State::Stopped,
                "error" => State::Error,
                _ => return Err(format!("unknown command '{verb}'")),
            };
            let target = match arg {
                Some(a) if a.eq_ignore_ascii_case("all") => Target::All,
                _ => Target::One(module(arg)?),
            };
            Command::Transition { state, target }
        }
    };
    Ok(command)
}

/// Entry point for the interactive console.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(app: &App, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "joan>".bold().cyan());
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

        if line.trim().is_empty() {
            continue;
        }

        match parse(&line) {
            Ok(Command::Quit) => {
                println!("{}", "Stopping modules …".dimmed());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(cmd) => execute(app, cmd),
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg,
                "help".bold()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn execute(app: &App, cmd: Command) {
    match cmd {
        Command::Help => cmd_help(),
        Command::Modules => cmd_modules(app),
        Command::State(id) => cmd_state(app, id),
        Command::Transition { state, target } => cmd_transition(app, state, target),
        Command::News(id) => cmd_news(app, id),
        Command::Connect => {
            app.carla().connect();
            println!("{}", "✓ Carla connected".green());
        }
        Command::Disconnect => {
            app.carla().disconnect();
            println!("{}", "Carla disconnected".yellow());
        }
        Command::Quit => {}
    }
}

fn cmd_help() {
    println!();
    println!("{}", "JOAN Commands".bold().underline());
    println!("  {}                          – list modules", "modules".bold().cyan());
    println!("  {}                 – state and allowed next states", "state <module>".bold().cyan());
    println!("  {} – request a transition", "idle|ready|run|stop|error <m|all>".bold().cyan());
    println!("  {}                 – published values", "news [module]".bold().cyan());
    println!("  {}            – toggle the Carla connection", "connect|disconnect".bold().cyan());
    println!("  {}                     – stop everything and exit", "quit|exit".bold().cyan());
    println!();
}

fn cmd_modules(app: &App) {
    println!("{}", "Modules".bold().underline());
    for manager in app.managers() {
        let id = manager.id();
        println!(
            "  {:<24} {:<10} {}",
            id.key().bold(),
            paint(manager.current_state()),
            id.display_name().dimmed()
        );
    }
}

fn cmd_state(app: &App, id: ModuleId) {
    let Some(manager) = app.manager(id) else {
        println!("{} {} is not part of this session", "Error:".red(), id);
        return;
    };
    let next: Vec<String> = manager
        .state_machine()
        .allowed_targets()
        .iter()
        .map(|s| s.to_string())
        .collect();
    println!(
        "  {} is {} (next: {})",
        id.key().bold(),
        paint(manager.current_state()),
        next.join(", ").dimmed()
    );
}

fn cmd_transition(app: &App, state: State, target: Target) {
    let outcomes = match app.request(target, state, "operator") {
        Ok(outcomes) => outcomes,
        Err(e) => {
            println!("{} {}", "Error:".red(), e);
            return;
        }
    };
    for (id, outcome) in outcomes {
        match outcome {
            Ok(_) => {}
            Err(JoanError::TransitionRejected { reason, .. }) => {
                println!("  {} {} refused: {}", "✗".red(), id.key().bold(), reason.yellow());
            }
            Err(e) => println!("  {} {}", "✗".red(), e),
        }
    }
}

fn cmd_news(app: &App, id: Option<ModuleId>) {
    let news = app.news();
    let keys: Vec<ModuleId> = match id {
        Some(id) => vec![id],
        None => news.available_keys().collect(),
    };
    if keys.is_empty() {
        println!("  {}", "no module has published yet".dimmed());
    }
    for key in keys {
        match news.snapshot(key) {
            Some(value) => {
                let body = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                println!("{}", key.key().bold());
                for line in body.lines() {
                    println!("  {line}");
                }
            }
            None => println!("  {} {}", key.key().bold(), "has not published".dimmed()),
        }
    }
}

/// State name coloured for the console.
pub fn paint(state: State) -> colored::ColoredString {
    let name = state.as_str();
    match state {
        State::Idle => name.normal(),
        State::Ready => name.cyan(),
        State::Running => name.green().bold(),
        State::Stopped => name.dimmed(),
        State::Error => name.red().bold(),
    }
}
