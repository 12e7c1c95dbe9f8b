use anyhow::Result;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod cmd_compact;
mod cmd_log;
mod cmd_recover;
mod cmd_status;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    use clap::Parser;
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Status { path, json } => cmd_status::exec(path, json),
        cli::Cmd::Log { path, json } => cmd_log::exec(path, json),
        cli::Cmd::Recover { path, out } => cmd_recover::exec(path, out),
        cli::Cmd::Compact { path } => cmd_compact::exec(path),
    }
}
