//! Binary entrypoint for the vlcchat CLI.
//!
//! Commands:
//! - `init` - create a starter `config.toml`
//! - `start [--port <path>]` - connect to the modem and chat from the console
//! - `contacts` - list stored conversations
//! - `history <MAC>` - print one conversation
//! - `forget <MAC>` - delete one conversation
//! - `smoketest --port <path> [--timeout <s>]` - configure the modem and dump its events
//!
//! See the library crate docs for module-level details: `vlcchat::`.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use vlcchat::config::Config;
use vlcchat::device::VlcDevice;
use vlcchat::metrics;
use vlcchat::session::{ChatSession, SessionEvent};
use vlcchat::storage::{format_timestamp, ConversationStore, Direction, SharedStore};

#[derive(Parser)]
#[command(name = "vlcchat")]
#[command(about = "Text chat over a serial-attached optical modem")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Connect to the modem and chat from the console
    Start {
        /// Modem serial port (e.g., /dev/ttyACM0), overrides the config file
        #[arg(short, long)]
        port: Option<String>,
    },
    /// List contacts with stored conversations
    Contacts,
    /// Print the conversation with one contact
    History {
        /// Contact address
        mac: String,
    },
    /// Delete the conversation with one contact
    Forget {
        /// Contact address
        mac: String,
    },
    /// Configure the modem and print its events as JSON lines
    SmokeTest {
        /// Modem serial port
        #[arg(short, long)]
        port: String,
        /// Seconds to listen before stopping
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => match Config::load(&cli.config).await {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("{}", e);
                None
            }
        },
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Start { port } => {
            let mut config = pre_config.ok_or_else(|| anyhow!("A valid config file is required"))?;
            if let Some(port) = port {
                config.device.port = port;
            }
            run_console(config).await?;
        }
        Commands::Contacts => {
            let store = open_store(&pre_config.unwrap_or_default())?;
            for conversation in store.conversations() {
                println!(
                    "{:<16} sent {:>4}  received {:>4}",
                    conversation.contact,
                    conversation.sent.len(),
                    conversation.received.len()
                );
            }
        }
        Commands::History { mac } => {
            let store = open_store(&pre_config.unwrap_or_default())?;
            print_history(&store, &mac)?;
        }
        Commands::Forget { mac } => {
            let mut store = open_store(&pre_config.unwrap_or_default())?;
            if store.delete_contact(&mac)? {
                println!("Deleted conversation with {}", mac.to_uppercase());
            } else {
                println!("No conversation with {}", mac.to_uppercase());
            }
        }
        Commands::SmokeTest { port, timeout } => {
            let mut device_config = pre_config.unwrap_or_default().device;
            device_config.port = port;
            run_smoketest(device_config, timeout).await?;
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<ConversationStore> {
    let store = ConversationStore::open(&config.storage.history_file)
        .map_err(|e| anyhow!("Failed to open history {}: {}", config.storage.history_file, e))?;
    Ok(store.with_autosave(config.storage.autosave))
}

fn print_history(store: &ConversationStore, mac: &str) -> Result<()> {
    let conversation = store.get_conversation(mac)?;
    for entry in conversation.timeline() {
        let ts = format_timestamp(&entry.record.timestamp);
        match entry.direction {
            Direction::Sent => {
                let status = entry
                    .record
                    .ack_status
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                println!("{}  >> {}  [{}]", ts, entry.record.text, status);
            }
            Direction::Received => println!("{}  << {}", ts, entry.record.text),
        }
    }
    Ok(())
}

async fn run_console(config: Config) -> Result<()> {
    info!("Starting vlcchat v{}", env!("CARGO_PKG_VERSION"));
    let store: SharedStore = open_store(&config)?.into_shared();
    let device = Arc::new(VlcDevice::serial(config.device.clone()));
    let (session, mut events) = ChatSession::new(device, Arc::clone(&store), &config.session);
    session.start().await?;
    println!("Connected as {}. Type @<MAC> <text> to send, /help for commands.", config.device.mac);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(SessionEvent::Received { contact, text, .. }) => println!("<< {}: {}", contact, text),
                    Some(SessionEvent::Delivered { contact, timestamp }) => {
                        println!("✓ delivered to {} ({})", contact, format_timestamp(&timestamp))
                    }
                    Some(SessionEvent::TimedOut { contact, timestamp }) => {
                        println!("✗ no ack from {} ({})", contact, format_timestamp(&timestamp))
                    }
                    None => break,
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_console_line(&session, &store, line.trim()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.stop().await;
    info!("Session closed: {:?}", metrics::snapshot());
    Ok(())
}

/// Returns `false` when the user asked to quit.
fn handle_console_line(session: &ChatSession, store: &SharedStore, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if let Some(rest) = line.strip_prefix('@') {
        let Some((mac, text)) = rest.split_once(' ') else {
            println!("usage: @<MAC> <text>");
            return true;
        };
        match session.send_text(mac, text) {
            Ok(_) => println!(">> {}: {}", mac.to_uppercase(), text),
            Err(e) => println!("not sent: {}", e),
        }
        return true;
    }
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("/quit") | Some("/exit") => return false,
        Some("/contacts") => {
            let contacts = match store.lock() {
                Ok(store) => store.list_contacts(),
                Err(poisoned) => poisoned.into_inner().list_contacts(),
            };
            for contact in contacts {
                println!("{}", contact);
            }
        }
        Some("/history") => match parts.next() {
            Some(mac) => {
                let result = match store.lock() {
                    Ok(store) => print_history(&store, mac),
                    Err(poisoned) => print_history(&poisoned.into_inner(), mac),
                };
                if let Err(e) = result {
                    println!("{}", e);
                }
            }
            None => println!("usage: /history <MAC>"),
        },
        _ => println!("commands: @<MAC> <text>, /contacts, /history <MAC>, /quit"),
    }
    true
}

async fn run_smoketest(device_config: vlcchat::config::DeviceConfig, timeout: u64) -> Result<()> {
    use tokio::time::{sleep, Duration};

    info!("Starting smoke test on {} @ {} baud", device_config.port, device_config.baud_rate);
    let device = VlcDevice::serial(device_config);
    device.subscribe_stats(|stats| match serde_json::to_string(stats) {
        Ok(line) => println!("{{\"event\":\"stats\",\"data\":{}}}", line),
        Err(e) => warn!("Cannot encode stats: {}", e),
    });
    device.subscribe_message(|contact, text, _| {
        let payload = serde_json::json!({"event": "message", "contact": contact, "text": text});
        println!("{}", payload);
    });
    device.subscribe_ack(|contact, timestamp| {
        let payload = serde_json::json!({
            "event": "ack",
            "contact": contact,
            "timestamp": format_timestamp(&timestamp),
        });
        println!("{}", payload);
    });

    if let Err(e) = device.start().await {
        error!("Smoke test failed: {}", e);
        println!("{}", serde_json::json!({"status": "error", "reason": e.to_string()}));
        std::process::exit(1);
    }
    sleep(Duration::from_secs(timeout)).await;
    device.stop().await;

    let payload = serde_json::json!({
        "status": "ok",
        "timeout_seconds": timeout,
        "metrics": metrics::snapshot(),
    });
    println!("{}", payload);
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Mirror to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
