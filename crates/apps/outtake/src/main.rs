//! Outtake - export Gmail to Maildir, efficiently.
//!
//! This is the CLI entry point: argument parsing, logging setup and
//! progress rendering. All synchronization logic lives in the `mail` crate.

use anyhow::{Result, bail};
use clap::Parser;
use crossbeam::channel::{Receiver, unbounded};
use indicatif::{ProgressBar, ProgressStyle};
use log::error;
use mail::{GmailSync, Progress, SyncOptions};
use std::path::PathBuf;
use std::thread;

#[derive(Parser)]
#[command(name = "outtake", version, about = "Export Gmail to Maildir, efficiently")]
struct Cli {
    /// Maildir to output to
    #[arg(short, long)]
    directory: PathBuf,

    /// Force a full sync
    #[arg(long)]
    full: bool,

    /// Only sync messages carrying this label
    #[arg(short, long)]
    label: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    if cli.directory.exists() && !cli.directory.is_dir() {
        bail!("{} exists and is not a directory", cli.directory.display());
    }

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {e:#}");
    }

    let mut sync = GmailSync::connect(&cli.directory, cli.label, SyncOptions::default())?;

    let (tx, rx) = unbounded::<Progress>();
    let renderer = thread::spawn(move || render_progress(rx));

    let result = sync.sync(cli.full, Some(tx));
    // The sender is gone once sync returns, so the renderer drains and
    // exits on its own.
    let _ = renderer.join();
    result
}

fn render_progress(rx: Receiver<Progress>) {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{pos}/{len} ({percent}%) {wide_bar}") {
        bar.set_style(style);
    }
    for p in rx {
        bar.set_length(p.total);
        bar.set_position(p.current);
    }
    bar.finish_and_clear();
}
