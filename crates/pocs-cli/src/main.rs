//! `pocs-cli` – POCS Operator Console
//!
//! This binary is the operator's entry point to the observatory.  It:
//!
//! 1. Loads `~/.pocs/config.toml` (writing the defaults on first run) and
//!    applies `POCS_*` environment overrides.
//! 2. Attaches the observatory controller: a simulated mount plus the
//!    configured cameras, each either simulated or driven by an external
//!    capture command.
//! 3. Drops the user into an **interactive shell** with slash-commands
//!    (`/messaging`, `/polar`, `/listen`, `/park`, `/help`, …).
//! 4. Routes **Ctrl-C** to the running operation, or, when idle, parks the
//!    mount and powers down before exiting.

mod config;
mod repl;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use pocs_hal::{Controller, ProcessCamera, SimCamera, SimController, SimMount, SimObservatory};
use pocs_runtime::{Session, SessionConfig};
use pocs_types::PocsError;

use crate::config::Config;
use crate::repl::{InterruptSlot, Shell};

fn main() {
    // Logs go to stderr; the shell's own output uses println!.
    let _telemetry = pocs_runtime::init_tracing("pocs-cli");

    print_banner();

    let cfg = load_config();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let interrupts = InterruptSlot::default();
    let shutdown = CancellationToken::new();
    let (slot, stop) = (interrupts.clone(), shutdown.clone());
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        if slot.fire() {
            println!("{}", "⚠  Ctrl-C received – interrupting current operation …".yellow().bold());
        } else {
            println!("{}", "⚠  Ctrl-C received – shutting down safely …".yellow().bold());
            stop.cancel();
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; operations cannot be interrupted");
    }

    runtime.block_on(async move {
        let session = match start_session(&cfg) {
            Ok(session) => session,
            Err(e) => {
                println!("{}: {}", "Cannot start session".red(), e);
                return;
            }
        };
        println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
        Shell::new(session, cfg, interrupts, shutdown).run().await;
    });
}

/// Load the config, falling back to defaults.  Writes the defaults on first
/// run so the operator has a file to edit.
fn load_config() -> Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            let mut cfg = cfg;
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

/// Build the observatory from `cfg` and attach it to a new session.
fn start_session(cfg: &Config) -> Result<Session, PocsError> {
    let mut observatory = SimObservatory::new().with_mount(SimMount::new().with_slew_polls(3));
    for camera in &cfg.cameras {
        observatory = if camera.command.is_empty() {
            let sim = SimCamera::new(camera.id.clone());
            observatory.with_camera(if camera.primary { sim.primary() } else { sim })
        } else {
            observatory.with_camera_driver(Box::new(ProcessCamera::new(
                camera.id.clone(),
                camera.primary,
                camera.command.clone(),
            )?))
        };
    }
    let controller: Box<dyn Controller> = Box::new(SimController::new(observatory.build()));

    let mut session = Session::new(SessionConfig {
        host: cfg.host.clone(),
        ports: cfg.ports(),
        images_dir: cfg.images_dir.clone(),
        alignment_log: cfg.alignment_log.clone(),
        ..SessionConfig::default()
    })?;
    session.attach(controller)?;
    println!(
        "  Controller attached: cameras {}",
        cfg.cameras.iter().map(|c| c.id.as_str()).collect::<Vec<_>>().join(", ").bold()
    );
    Ok(session)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___  ____  ________"#.bold().cyan());
    println!("{}", r#"  / _ \/ __ \/ ___/ __/"#.bold().cyan());
    println!("{}", r#" / ___/ /_/ / /___\ \  "#.bold().cyan());
    println!("{}", r#"/_/   \____/\___/___/  "#.bold().cyan());
    println!();
    println!("  {} {}",
        "POCS".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Observatory Operator Console");
    println!();
}
