use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod clock;
mod dispatch;
mod error;
mod frame;
mod handshake;
mod input;
mod link;
mod loopback;
mod rx;
mod session;
mod stats;
mod transfer;
mod tx;

fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let default = if args.verbose {
        "link_hammer=debug"
    } else {
        "link_hammer=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.cmd {
        cli::Cmd::Tx(opts) => tx::run(opts),
        cli::Cmd::Rx(opts) => rx::run(opts),
        cli::Cmd::Loopback(opts) => loopback::run(opts),
    }
}
