mod api;
mod app;
mod cache;
mod catalog;
mod commands;
mod config;
mod event;
mod logging;
mod notify;
mod query;
mod render;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use crate::app::{App, Flow};
use crate::commands::Command;

#[derive(Parser, Debug)]
#[command(name = "hpadmin")]
#[command(about = "Manage a headphone catalog from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hpadmin/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Catalog API base URL (overrides config and HPADMIN_API_URL)
  #[arg(long)]
  api_url: Option<String>,

  /// Command to run; starts the interactive shell when omitted
  #[command(subcommand)]
  command: Option<Command>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override API URL if specified on command line
  if let Some(url) = args.api_url {
    config.api.base_url = url;
  }

  let guard = logging::init(&config.log)?;

  let mut app = App::new(&config)?;
  let flow = match args.command {
    None | Some(Command::Shell) => {
      app.run_shell().await?;
      Flow::Done
    }
    Some(command) => app.execute(command).await?,
  };

  if flow == Flow::Failed {
    // Flush buffered log lines before exiting
    drop(guard);
    std::process::exit(1);
  }

  Ok(())
}
