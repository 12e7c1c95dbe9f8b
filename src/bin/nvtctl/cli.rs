use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Инструменты обслуживания корня nvthreads
#[derive(Parser, Debug)]
#[command(name = "nvtctl", version, about = "nvthreads engine root inspector")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Meta, log, image and process files of an engine root
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List committed epochs in the log
    Log {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Reconstruct the region image (image + committed epochs) into a file
    Recover {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Fold the log into region.img and truncate the log (engine must not be running)
    Compact {
        #[arg(long)]
        path: PathBuf,
    },
}
