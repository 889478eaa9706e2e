use crate::build_info;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    about = "Durable queue consumer running configured pipelines",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[clap(short, long)]
    /// Runtime config file; overrides PIPELINE_CONFIG
    pub config: Option<PathBuf>,

    #[clap(long)]
    /// Don't run background compaction, even for queues that enable it
    pub no_compaction: bool,

    #[clap(long)]
    /// Health/metrics listen address; overrides SERVER_ADDR
    pub server_addr: Option<SocketAddr>,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
