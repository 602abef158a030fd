use std::path::PathBuf;

use clap::Parser;

use crate::api::LocalAddress;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Directory holding the persistent gateway config
    #[arg(env = "HESTIA_CONFIG_DIR", long = "config-dir", value_name = "dir")]
    pub config_dir: Option<PathBuf>,

    /// Control API listen address, TCP `host:port` or a unix socket path
    #[arg(
        env = "HESTIA_LOCAL_API_ADDRESS",
        long = "local-api-address",
        value_name = "addr"
    )]
    pub local_api_address: Option<LocalAddress>,

    /// Re-run the first-time setup wizard, clearing provisioning
    #[arg(long = "reset")]
    pub reset: bool,
}

pub fn parse() -> Cli {
    Parser::parse()
}
