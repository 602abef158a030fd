mod api;
mod cli;
mod config;
mod discovery;
mod identity;
mod net;
mod provision;
mod remote;
mod util;
mod wizard;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::api::{Listener, LocalAddress};
use crate::config::SharedConfig;
use crate::discovery::Deduper;
use crate::identity::DeviceId;
use crate::net::Nmcli;
use crate::provision::Provisioner;
use crate::remote::{start_heartbeat, Remote, HEARTBEAT_PERIOD};
use crate::util::store::Store;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Some log defaults; override with RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("debug".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("reqwest=info".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = cli::parse();

    let store = Store::new(cli.config_dir.clone().unwrap_or_else(config_dir));
    let (config, first_run) = SharedConfig::load(store).await?;

    if cli.reset || first_run {
        wizard::run(&config).await?;
    }

    let identifier = DeviceId::detect();
    info!("gateway identifier {identifier}");

    let snapshot = config.snapshot().await;
    info!(
        "pairing service {} advertised as {}",
        provision::SERVICE_UUID,
        snapshot.device_name
    );
    debug!(
        "pairing characteristics: credentials {}, status {}",
        provision::CHAR_CREDENTIALS_UUID,
        provision::CHAR_STATUS_UUID
    );
    debug!(
        "expecting discovery messages from {}:{} topic {}",
        snapshot.mqtt_broker,
        snapshot.mqtt_port,
        discovery::DISCOVERY_TOPIC
    );

    let remote = Arc::new(Remote::new(config.clone(), identifier));
    let provisioner = Arc::new(Provisioner::new(
        config.clone(),
        Arc::clone(&remote),
        Nmcli,
    ));
    let deduper = Arc::new(Deduper::new(config.clone(), Arc::clone(&remote)));

    let local_address = cli.local_api_address.clone().unwrap_or_default();
    let listener = match &local_address {
        LocalAddress::Tcp(socket_addr) => Listener::Tcp(TcpListener::bind(socket_addr).await?),
        LocalAddress::Unix(path) => Listener::Unix(UnixListener::bind(path)?),
    };
    debug!("bound control api to {local_address}");

    // Run until interrupted. The control API and the heartbeat both run for
    // the process lifetime; ctrl-c wins the select and drops the listener
    // and all tasks with it.
    tokio::select! {
        _ = api::start(listener, provisioner, deduper) => {}
        _ = start_heartbeat(config.clone(), Arc::clone(&remote), HEARTBEAT_PERIOD) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    Ok(())
}

fn config_dir() -> PathBuf {
    let dir = if let Some(config_dir) = dirs::config_dir() {
        config_dir
    } else {
        // Fallback to home directory if config dir is not available
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    };
    dir.join(env!("CARGO_PKG_NAME"))
}
