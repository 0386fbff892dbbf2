//! tsuku - post-install verification
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Checks that installed tools and libraries still work: headers are sane,
//! dependencies resolve, files load, and contents match what was installed.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.tsuku/
//! ├── tools/<name>-<version>/   # installed tools, each with a receipt
//! ├── libs/<name>-<version>/    # installed libraries, each with a receipt
//! ├── config.toml               # optional [verify] settings
//! └── registry.toml             # optional system library overlay
//! ```

pub mod cmd;
pub mod ui;

use clap::{Args, Parser, Subcommand};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tsuku_schema::LinuxFamily;

pub use tsuku_core::paths::*;

/// Exit status for an interrupted run (128 + SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "tsuku")]
#[command(author, version = env!("TSUKU_VERSION"), about = "tsuku - verify installed tools and libraries")]
pub struct Cli {
    /// Managed root (defaults to ~/.tsuku)
    #[arg(long, global = true, env = "TSUKU_HOME")]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Tier 3 settings live in the `[verify]` table of `config.toml`.
const VERIFY_NOTES: &str = "\
Load test (Tier 3) settings are read from the [verify] table of config.toml:
  dltest_batch_size     files loaded per helper process (default 50)
  dltest_timeout_secs   time limit per helper batch, not per artifact (default 5)
  dltest_helper         path to tsuku-dltest (also TSUKU_DLTEST)";

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Verify installed artifacts and everything they depend on
    #[command(after_help = VERIFY_NOTES)]
    Verify(VerifyArgs),
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    /// Artifacts to verify: name or name@version
    #[arg(required = true)]
    pub artifacts: Vec<String>,

    /// Show every tier, full digests and a dependency table
    #[arg(short, long)]
    pub verbose: bool,

    /// Report checksum mismatches as warnings
    #[arg(long)]
    pub skip_integrity: bool,

    /// Do not run the load test (Tier 3)
    #[arg(long)]
    pub skip_dlopen: bool,

    /// Verify against a Linux family instead of the detected host
    /// (debian, rhel, arch, alpine, suse)
    #[arg(long, value_name = "FAMILY")]
    pub target_family: Option<LinuxFamily>,

    /// Maximum artifacts verified at once
    #[arg(long, short = 'j')]
    pub workers: Option<NonZeroUsize>,
}
