//! REPL – the operator console of a booted firmware.
//!
//! Supported commands:
//!   up | down | left | right | select – press a navigation key
//!   status                            – show the display's status bar
//!   services                          – list registered services
//!   wifi <ssid>                       – connect Wi-Fi (no SSID: scan)
//!   bt <address> | bt off             – connect / drop Bluetooth (no arg: scan)
//!   config                            – print the effective configuration
//!   help                              – show this list
//!   quit | exit                       – shut down
//!
//! EOF and Ctrl-C behave like `quit`.

use std::io::Write;
use std::str::FromStr;

use colored::Colorize;
use kraken_runtime::services::BtAddress;
use kraken_runtime::{Firmware, InputKey};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::config::{self, Config};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Key(InputKey),
    Status,
    Services,
    WifiConnect(String),
    WifiScan,
    BtConnect(BtAddress),
    BtDisconnect,
    BtScan,
    Config,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let head = words.next().ok_or_else(|| "empty command".to_string())?;
        let command = match head.to_ascii_lowercase().as_str() {
            "status" => Command::Status,
            "services" => Command::Services,
            "wifi" => match words.next() {
                Some(ssid) => Command::WifiConnect(ssid.to_string()),
                None => Command::WifiScan,
            },
            "bt" => match words.next() {
                Some("off") => Command::BtDisconnect,
                Some(addr) => Command::BtConnect(addr.parse().map_err(|e| format!("{e}"))?),
                None => Command::BtScan,
            },
            "config" => Command::Config,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => other
                .parse::<InputKey>()
                .map(Command::Key)
                .map_err(|_| format!("unknown command '{other}'"))?,
        };
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument '{extra}'"));
        }
        Ok(command)
    }
}

/// Run the console until `quit`, EOF or Ctrl-C.
pub async fn run(firmware: &Firmware, cfg: &Config) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", "kraken>".bold().cyan());
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Ok(command) => execute(firmware, cfg, command).await,
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e,
                "help".bold()
            ),
        }
    }
}

async fn execute(firmware: &Firmware, cfg: &Config, command: Command) {
    match command {
        Command::Key(key) => {
            if let Err(e) = firmware.press(key).await {
                warn!(%key, error = %e, "key press not delivered");
                println!("{}: {}", "Input error".red(), e);
            }
        }
        Command::Status => {
            println!("  {}", firmware.display().status());
            println!(
                "  uptime {} ms, {} listener(s)",
                firmware.kernel().tick_count_ms(),
                firmware.kernel().listener_count().await.unwrap_or(0)
            );
        }
        Command::Services => match firmware.kernel().services().await {
            Ok(services) => {
                for s in services {
                    println!(
                        "  {:<12} {:<10} {}",
                        s.name.bold(),
                        format!("{:?}", s.state),
                        format!("{:?}", s.permissions).dimmed()
                    );
                }
            }
            Err(e) => println!("{}: {}", "Registry error".red(), e),
        },
        Command::WifiConnect(ssid) => match firmware.wifi().connect(&ssid).await {
            Ok(ip) => println!("  {} connected to {} as {}", "✓".green(), ssid.bold(), ip),
            Err(e) => println!("{}: {}", "Wi-Fi error".red(), e),
        },
        Command::WifiScan => match firmware.wifi().scan().await {
            Ok(networks) => {
                for n in networks {
                    println!("    • {}", n);
                }
            }
            Err(e) => println!("{}: {}", "Wi-Fi error".red(), e),
        },
        Command::BtConnect(address) => match firmware.bluetooth().connect(address).await {
            Ok(()) => println!("  {} paired with {}", "✓".green(), address.to_string().bold()),
            Err(e) => println!("{}: {}", "Bluetooth error".red(), e),
        },
        Command::BtDisconnect => {
            if let Err(e) = firmware.bluetooth().disconnect().await {
                println!("{}: {}", "Bluetooth error".red(), e);
            }
        }
        Command::BtScan => match firmware.bluetooth().scan().await {
            Ok(peers) => {
                for p in peers {
                    println!("    • {}", p);
                }
            }
            Err(e) => println!("{}: {}", "Bluetooth error".red(), e),
        },
        Command::Config => match config::render(cfg) {
            Ok(raw) => println!("{raw}"),
            Err(e) => println!("{}: {}", "Config error".red(), e),
        },
        Command::Help => print_help(),
        Command::Quit => {}
    }
}

fn print_help() {
    println!();
    println!("{}", "Kraken Commands".bold().underline());
    println!("  {}  – navigation keys", "up down left right select".bold().cyan());
    println!("  {}                     – show the status bar", "status".bold().cyan());
    println!("  {}                   – list registered services", "services".bold().cyan());
    println!("  {}                – connect Wi-Fi (no SSID: scan)", "wifi <ssid>".bold().cyan());
    println!(
        "  {}         – pair Bluetooth (no address: scan)",
        "bt <address> | off".bold().cyan()
    );
    println!(
        "  {}                     – print the effective configuration",
        "config".bold().cyan()
    );
    println!("  {}                – shut down", "quit  exit".bold().cyan());
    println!();
}
