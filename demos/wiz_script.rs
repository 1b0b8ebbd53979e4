//! CLI application for running scripts against Wiz lights.
//!
//! This demo shows the main scripting building blocks:
//! - Toggling power per bulb with [`PowerToggle`]
//! - Blinking with a [`Pipeline`]
//! - Polling state on a loop with a [`Repeater`]
//!
//! Run with: cargo run --example wiz_script -- --help
//!
//! Add `--fake` to try it against in-memory bulbs instead of the network.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use wiz_script_rs::fake::{FakeDevice, MemorySession};
use wiz_script_rs::{
    Error, ErrorCatcher, Message, Pipeline, PowerToggle, Reference, Repeater, RunOptions,
    ScriptPart, Serial, Session, Target, TransportConfig, WizSession,
};

#[derive(Parser)]
#[command(name = "wiz-script")]
#[command(about = "Run scripts against Wiz smart lights", long_about = None)]
struct Cli {
    /// Comma separated MAC addresses of the bulbs to use (default: every bulb found)
    #[arg(short, long, global = true, default_value = "")]
    serials: String,

    /// Use in-memory bulbs instead of the network
    #[arg(long, global = true)]
    fake: bool,

    /// Seconds to wait for each reply
    #[arg(short, long, global = true, default_value = "5")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the bulbs that answer discovery
    Discover,

    /// Turn each bulb off if it is on, and on if it is off
    Toggle,

    /// Blink the bulbs a few times
    Blink {
        /// Number of blinks
        #[arg(short, long, default_value = "3")]
        times: usize,

        /// Seconds between each change
        #[arg(long, default_value = "0.5")]
        spread: f64,

        /// Let every bulb blink at its own pace
        #[arg(long)]
        independent: bool,
    },

    /// Print the state of the bulbs every few seconds
    Watch {
        /// Seconds between polls
        #[arg(short, long, default_value = "5")]
        every: u64,

        /// Number of polls
        #[arg(short, long, default_value = "3")]
        count: usize,
    },
}

fn session(cli: &Cli) -> Arc<dyn Session> {
    if cli.fake {
        let bulbs = ["d073d5000001", "d073d5000002", "d073d5000003"]
            .into_iter()
            .enumerate()
            .map(|(i, serial)| FakeDevice::new(Serial::new(serial)).with_power(i % 2 == 0))
            .collect();
        Arc::new(MemorySession::new(bulbs))
    } else {
        Arc::new(WizSession::new(TransportConfig::default()))
    }
}

fn script(command: &Commands) -> Option<ScriptPart> {
    match command {
        Commands::Discover => None,
        Commands::Toggle => Some(PowerToggle::new().into()),
        Commands::Blink {
            times,
            spread,
            independent,
        } => {
            let mut pipeline = Pipeline::new()
                .spread(Duration::from_secs_f64(*spread))
                .synchronized(!independent);
            for _ in 0..*times {
                pipeline = pipeline
                    .then([Message::set_state(false)])
                    .then([Message::set_state(true)]);
            }
            Some(pipeline.into())
        }
        Commands::Watch { every, count } => {
            let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(*count));
            let repeater = Repeater::new([Message::get_pilot()])
                .min_loop_time(Duration::from_secs(*every))
                .on_done_loop(move || {
                    let left = remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    async move {
                        if left <= 1 {
                            Err(Error::StopLoop)
                        } else {
                            Ok(())
                        }
                    }
                });
            Some(repeater.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let session = session(&cli);
    let reference = Reference::from(cli.serials.as_str());

    let Some(part) = script(&cli.command) else {
        println!("Discovering Wiz lights...");
        let found = session
            .discover(None, Duration::from_secs(cli.timeout))
            .await?;
        if found.is_empty() {
            println!("No lights found on the network.");
        }
        for serial in found {
            println!("  - {}", serial);
        }
        return Ok(());
    };

    let options = RunOptions::default()
        .with_message_timeout(Duration::from_secs(cli.timeout))
        .with_catcher(ErrorCatcher::callback(|err| eprintln!("  ✗ {}", err)));

    let target = Target::new(session.clone());
    let mut replies = target.script([part]).run(reference, options);
    while let Some(reply) = replies.next().await {
        match reply {
            Ok(reply) => println!("  ✓ {} {}: {}", reply.serial, reply.method, reply.result),
            Err(err) => eprintln!("  ✗ {}", err),
        }
    }

    session.stop_handle().cancel();
    println!("\nDone!");
    Ok(())
}
