//! `kraken` – the Kraken firmware simulator.
//!
//! This binary is the host-side stand-in for the device. It:
//!
//! 1. Reads `kraken.toml` (or `$KRAKEN_CONFIG`); a missing file means the
//!    stock firmware.
//! 2. Boots the kernel and the stock services as the manifest says.
//! 3. Drops the user into an interactive console that drives the navigation
//!    keys and the Wi-Fi service.
//! 4. Shuts everything down in reverse order on `quit`, EOF or Ctrl-C.

mod config;
mod repl;

use std::process::ExitCode;

use colored::Colorize;
use kraken_runtime::{Firmware, init_tracing};
use tracing::error;

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG picks the filter (default "info"), KRAKEN_LOG_FORMAT=json
    // switches to JSON lines, OTEL_EXPORTER_OTLP_ENDPOINT enables export.
    let _tracing = init_tracing("kraken");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
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
                "  No config at {} – booting the stock firmware.",
                config::config_path().display().to_string().dimmed()
            );
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the async runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        // ── Boot ──────────────────────────────────────────────────────────
        let mut firmware = match Firmware::boot(cfg.kernel.clone(), cfg.boot.clone()).await {
            Ok(firmware) => firmware,
            Err(e) => {
                println!("{}: {}", "Boot failed".red().bold(), e);
                return ExitCode::FAILURE;
            }
        };

        println!();
        println!("  {}", firmware.display().status());
        println!(
            "  Type {} for a list of commands.\n",
            "help".bold().cyan()
        );

        // ── Interactive console ───────────────────────────────────────────
        repl::run(&firmware, &cfg).await;

        firmware.shutdown().await;
        println!("{}", "  ✓ Kraken stopped.".green());
        ExitCode::SUCCESS
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    __ __           __             "#.bold().cyan());
    println!("{}", r#"   / //_/________ _/ /_____  ____  "#.bold().cyan());
    println!("{}", r#"  / ,<  / ___/ __ `/ //_/ _ \/ __ \ "#.bold().cyan());
    println!("{}", r#" / /| |/ /  / /_/ / ,< /  __/ / / / "#.bold().cyan());
    println!("{}", r#"/_/ |_/_/   \__,_/_/|_|\___/_/ /_/  "#.bold().cyan());
    println!();
    println!("  {} {}",
        "Kraken".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Embedded service kernel simulator");
    println!();
}
