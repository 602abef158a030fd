use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// How long to give the network manager to associate and obtain a lease.
const JOIN_TIMEOUT: Duration = Duration::from_secs(45);

/// The seam to the OS network-join mechanism.
///
/// Joining is slow and may block for most of a minute. Failures come back
/// as `false`, never as an error the provisioning flow has to interpret.
#[async_trait]
pub trait NetworkJoin: Send + Sync {
    async fn join(&self, ssid: &str, password: &str) -> bool;
}

/// Joins WiFi networks through NetworkManager's `nmcli`.
pub struct Nmcli;

#[async_trait]
impl NetworkJoin for Nmcli {
    async fn join(&self, ssid: &str, password: &str) -> bool {
        info!("joining wifi network {ssid}");

        // Drop any stale profile for this SSID first. A leftover profile
        // with old credentials makes `nmcli dev wifi connect` trip over the
        // existing connection instead of reauthenticating.
        let _ = Command::new("nmcli")
            .args(["connection", "delete", ssid])
            .output()
            .await;

        let connect = Command::new("nmcli")
            .args(["dev", "wifi", "connect", ssid, "password", password])
            .output();

        match tokio::time::timeout(JOIN_TIMEOUT, connect).await {
            Ok(Ok(output)) if output.status.success() => {
                info!("joined {ssid}");
                true
            }
            Ok(Ok(output)) => {
                warn!(
                    "nmcli exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Ok(Err(err)) => {
                warn!("failed to run nmcli: {err}");
                false
            }
            Err(_) => {
                warn!("wifi join timed out after {JOIN_TIMEOUT:?}");
                false
            }
        }
    }
}
