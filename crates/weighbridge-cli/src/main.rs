//! `weighbridge` – scale station server.
//!
//! This binary wires the whole stack together.  It:
//!
//! 1. Loads `~/.weighbridge/config.toml`, writing a first-run config with one
//!    simulated scale when the file is absent.
//! 2. Builds the hardware links, the broadcast hub and the station registry,
//!    restoring persisted stations and seeding the configured ones.
//! 3. Serves the cockpit WebSocket protocol until **Ctrl-C**, then stops every
//!    weighing device and closes all sessions before exiting.

mod config;
mod wiring;

use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, warn};

use weighbridge_cockpit::CockpitServer;
use weighbridge_runtime::init_tracing;

/// Period of the idle-session sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // RUST_LOG filters (default "info"); WEIGHBRIDGE_LOG_FORMAT=json switches
    // to newline-delimited JSON.  User-facing output still uses println!.
    let _telemetry = init_tracing("weighbridge");

    print_banner();

    let cfg = load_or_initialise_config();
    let config_dir = config::config_path()
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let admin = match wiring::build_admin(&cfg, &config_dir) {
        Ok(admin) => admin,
        Err(e) => {
            error!(error = %e, "startup failed");
            println!("{}: {}", "Startup error".red(), e);
            std::process::exit(1);
        }
    };
    let hub = Arc::clone(admin.hub());
    let sweeper = hub.spawn_sweeper(SWEEP_INTERVAL);

    print_devices(&cfg);
    println!(
        "  {} {} station(s) registered",
        "•".cyan(),
        admin.registry().len()
    );
    if cfg.server.admin_token.is_empty() {
        println!(
            "  {}",
            "No admin token configured: station registration over the socket is disabled.".dimmed()
        );
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping scales …".yellow().bold());
        shutdown_signal.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let server = CockpitServer::new(Arc::clone(&admin))
        .with_port(cfg.server.port)
        .with_admin_token(Some(cfg.server.admin_token.clone()));
    println!(
        "\n  Cockpit on {}\n",
        format!("ws://localhost:{}", server.port()).bold().cyan()
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "cockpit server stopped");
                println!("{}: {}", "Server error".red(), e);
            }
        }
        _ = shutdown.notified() => {}
    }

    sweeper.abort();
    let closed = hub.close_all().await;
    println!("{}", format!("  ✓ {closed} session(s) closed.").green());
    println!("{}", "  ✓ Exiting weighbridge.".green());
}

fn load_or_initialise_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::first_run();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} First run: default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::first_run();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_devices(cfg: &config::Config) {
    if cfg.devices.is_empty() {
        println!("  {}", "No devices configured.".yellow());
        return;
    }
    println!("  Devices:");
    for device in &cfg.devices {
        let target = match device.driver {
            config::Driver::Sim => format!("seed {}", device.seed),
            config::Driver::Tcp => device.address.clone().unwrap_or_default(),
        };
        println!(
            "    • {} ({} {}, {} {})",
            device.id.bold(),
            device.driver,
            target.dimmed(),
            device.rated_capacity,
            device.unit
        );
    }
}

fn print_banner() {
    println!();
    println!("{}", r#" _      __    _      __   __       _    __"#.bold().cyan());
    println!("{}", r#"| | /| / /__ (_)__ _/ /  / /  ____(_)__/ /__ ____"#.bold().cyan());
    println!("{}", r#"| |/ |/ / -_) / _ `/ _ \/ _ \/ __/ / _  / _ `/ -_)"#.bold().cyan());
    println!("{}", r#"|__/|__/\__/_/\_, /_//_/_.__/_/ /_/\_,_/\_, /\__/"#.bold().cyan());
    println!("{}", r#"             /___/                      /___/"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Weighbridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Scale access and live weighing sessions");
    println!();
}
