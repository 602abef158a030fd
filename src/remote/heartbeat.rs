use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{info, instrument};

use crate::config::SharedConfig;

use super::Remote;

/// Period between liveness pings while provisioned.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

/// Ping the cloud on a fixed period for the life of the process.
///
/// Ticks while unprovisioned are no-ops. There is no backoff or jitter; a
/// failed ping is logged by the client and the next tick simply tries
/// again.
#[instrument(name = "heartbeat", skip_all)]
pub async fn start_heartbeat(config: SharedConfig, remote: Arc<Remote>, period: Duration) {
    info!("heartbeat every {period:?}");

    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if config.provisioned().await {
            remote.heartbeat().await;
        }
    }
}
