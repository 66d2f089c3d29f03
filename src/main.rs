//! Entry point for the pelink linker.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize logging from the configured level.
//! 3. Construct a link session with the `I386` backend (the only supported
//!    machine).
//! 4. Run the link pipeline: load, resolve, exports, assemble, relocate,
//!    write.
//!
//! Error handling is done via `anyhow`.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pelink::arch::i386::I386;
use pelink::config::Config;
use pelink::session::LinkSession;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let output = config.output.clone();
    let mut session = LinkSession::new(I386, &config);
    session.link()?;

    println!("Linked successfully to {}", output.display());
    Ok(())
}
