use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mediafork")]
#[command(author, version, about = "Crash-isolated media file reader and writer")]
pub struct Cli {
    /// Path to a preferences file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Decode in this process instead of a worker
    #[arg(long, global = true)]
    pub in_process: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open a media file and print its asset
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build or validate the sidecar table of contents of a file
    Toc {
        /// Source media file
        #[arg(required = true)]
        file: PathBuf,

        /// Only validate the existing table of contents
        #[arg(long)]
        check: bool,

        /// Rebuild even if a fresh table of contents exists
        #[arg(long, conflicts_with = "check")]
        force: bool,
    },

    /// Decode one video frame and write it as PNG
    Frame {
        /// Source media file
        #[arg(required = true)]
        file: PathBuf,

        /// Frame number to decode
        #[arg(short, long, default_value = "0")]
        position: i64,

        /// Video layer
        #[arg(long, default_value = "0")]
        layer: i32,

        /// Output PNG path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Read a run of samples from one channel and print statistics
    Samples {
        /// Source media file
        #[arg(required = true)]
        file: PathBuf,

        /// Channel to read
        #[arg(long, default_value = "0")]
        channel: i32,

        /// First sample
        #[arg(short, long, default_value = "0")]
        start: i64,

        /// Samples to read (defaults to the rest of the file)
        #[arg(short = 'n', long)]
        len: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective preferences as JSON
    Config {
        /// Exit with an error if the preferences produce warnings
        #[arg(long)]
        strict: bool,
    },
}
