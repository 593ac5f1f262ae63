//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use staticserv_core::config::DEFAULT_CONFIG_PATH;

/// Concurrent static-file HTTP/1.1 server.
///
/// Serves a document root over HTTP with a bounded admission queue,
/// per-worker LRU file caching, and a rotating access log. All runtime
/// settings come from the configuration file.
#[derive(Parser, Debug)]
#[command(name = "staticserv")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the configuration file
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Increase diagnostic output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error diagnostic output
    #[arg(short, long)]
    pub quiet: bool,
}
