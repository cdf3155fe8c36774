#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use despatch::{Despatch, find_config_file, submit::submit};
use tokio::io::AsyncReadExt;

/// Outbound mail delivery engine
#[derive(Parser, Debug)]
#[command(name = "despatch")]
#[command(about = "Deliver queued mail to remote SMTP servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file, taking precedence over the environment and default locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the delivery engine until interrupted (default)
    Run,
    /// Parse the configuration and exit
    Check,
    /// Queue a message for delivery
    Enqueue {
        /// Envelope sender
        #[arg(short, long)]
        from: String,
        /// Envelope recipient, may be repeated
        #[arg(short, long, required = true)]
        to: Vec<String>,
        /// File holding the message; read from stdin when absent
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config.as_deref())?;
    let despatch = Despatch::from_path(&config_path)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => despatch.run().await,
        Command::Check => {
            println!("{} is valid", config_path.display());
            Ok(())
        }
        Command::Enqueue { from, to, file } => {
            let body = match file {
                Some(path) => tokio::fs::read(&path).await?,
                None => {
                    let mut body = Vec::new();
                    tokio::io::stdin().read_to_end(&mut body).await?;
                    body
                }
            };

            let queue = despatch.open_queue()?;
            for mail in submit(&*queue, &from, &to, &body).await? {
                println!("{} {}", mail.id, mail.domain);
            }
            Ok(())
        }
    }
}
