//! CLI for relaybus
//!
//! Operator commands against the persistent store named in the
//! configuration:
//! - `publish`: append a message to a channel
//! - `dispatch`: deliver pending messages for a runner, printing each one
//! - `stats`: queue depth and dispatch state of a channel
//! - `runners`: offsets of every runner on a channel
//! - `prune`: apply the configured retention policy

use clap::Parser;
use relaybus::broker::{Message, Service};
use relaybus::config::{Settings, load_config};
use relaybus::persistence::PersistentService;
use relaybus::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relaybus")]
enum Command {
    /// Append a message to a channel
    Publish {
        channel: String,
        /// Message kind (type discriminator)
        kind: String,
        /// Attributes as a JSON object
        #[arg(default_value = "{}")]
        attributes: String,
    },
    /// Deliver pending messages to a runner, one JSON line per message,
    /// then the per-channel counts
    Dispatch {
        /// Runner (consumer group); defaults to `dispatch.runner`
        #[arg(long)]
        runner: Option<String>,
        /// Maximum messages per channel; defaults to `dispatch.limit`
        #[arg(long)]
        limit: Option<usize>,
        /// Channels to dispatch; all durable channels when omitted
        channels: Vec<String>,
    },
    /// Show queue depth and dispatch state of a channel
    Stats {
        channel: String,
        /// Count pending messages from this runner's offset
        #[arg(long)]
        runner: Option<String>,
    },
    /// List runner offsets on a channel
    Runners { channel: String },
    /// Delete messages outside the configured retention policy
    Prune { channel: String },
}

fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    logging::init(&settings.logging.level);

    if let Err(e) = run(cmd, &settings) {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

fn run(cmd: Command, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let service = PersistentService::open(&settings.store)?;

    match cmd {
        Command::Publish {
            channel,
            kind,
            attributes,
        } => {
            let attributes = serde_json::from_str(&attributes)?;
            let message = Message::new(kind, attributes);
            service.publish(&channel, &message)?;
            println!("{}", message.id());
        }
        Command::Dispatch {
            runner,
            limit,
            channels,
        } => {
            let runner = runner.unwrap_or_else(|| settings.dispatch.runner.clone());
            let limit = limit.or(settings.dispatch.limit);
            let channels = if channels.is_empty() {
                service.store().channel_names()?
            } else {
                channels
            };

            for channel in &channels {
                service.subscribe(channel, |message| {
                    println!("{}", serde_json::to_string(message)?);
                    Ok(())
                })?;
            }

            let names: Vec<&str> = channels.iter().map(String::as_str).collect();
            let counts = service.dispatch(&runner, &names, limit)?;
            let total: usize = counts.values().sum();
            info!(runner = %runner, channels = counts.len(), count = total, "dispatch finished");
            println!("{}", serde_json::to_string(&counts)?);
        }
        Command::Stats { channel, runner } => {
            let stats = service.channel_stats_for(&channel, runner.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Runners { channel } => {
            for runner in service.runners(&channel)? {
                println!("{}", serde_json::to_string(&runner)?);
            }
        }
        Command::Prune { channel } => {
            let removed = service.prune(&channel)?;
            println!("{removed}");
        }
    }

    service.store().flush()?;
    Ok(())
}
