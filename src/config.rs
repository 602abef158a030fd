use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::util::http::Uri;
use crate::util::store::{Store, StoreError};

const CONFIG_NAME: &str = "gateway";

// IMPORTANT: GatewayConfig is persisted to disk. Fields must keep their
// serialized names and carry defaults, so a config written by an older
// build still loads. A config that fails to deserialize makes the gateway
// forget it was ever provisioned.

/// Durable gateway configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// One-time code issued by the cloud, empty until the operator or the
    /// pairing peer supplies one.
    #[serde(default)]
    pub invite_code: String,

    /// Cloud API root.
    #[serde(rename = "apiBaseUrl", alias = "apiUrl", default = "default_api_endpoint")]
    pub api_endpoint: Uri,

    /// Local bus broker; read by the out-of-process bus bridge.
    #[serde(default = "default_mqtt_broker")]
    pub mqtt_broker: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    /// Human label, also the name the pairing bridge advertises.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// True once a registration call has succeeded. Cleared only by the
    /// setup wizard.
    #[serde(default)]
    pub provisioned: bool,
}

fn default_api_endpoint() -> Uri {
    Uri::from_static("http://localhost:3211/api")
}

fn default_mqtt_broker() -> String {
    "localhost".to_owned()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_device_name() -> String {
    "hestia-gateway".to_owned()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            invite_code: String::new(),
            api_endpoint: default_api_endpoint(),
            mqtt_broker: default_mqtt_broker(),
            mqtt_port: default_mqtt_port(),
            device_name: default_device_name(),
            provisioned: false,
        }
    }
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] StoreError);

/// Shared handle to the gateway configuration.
///
/// The provisioning handler, the discovery pipeline and the heartbeat all
/// read the same config, and the first of those mutates it. All access goes
/// through this handle: read-modify-write sequences are serialized behind
/// one lock, and every mutation is persisted before the write lock is
/// released, so no reader observes state that was never durable.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<GatewayConfig>>,
    store: Store,
}

impl SharedConfig {
    /// Load the stored config, or create and persist defaults on first run.
    ///
    /// The returned flag is true when no stored config existed yet.
    pub async fn load(store: Store) -> Result<(Self, bool), ConfigError> {
        let (config, first_run) = match store.read(CONFIG_NAME).await? {
            Some(config) => (config, false),
            None => {
                debug!("no stored config, writing defaults");
                let config = GatewayConfig::default();
                store.write(CONFIG_NAME, &config).await?;
                (config, true)
            }
        };

        Ok((
            Self {
                inner: Arc::new(RwLock::new(config)),
                store,
            },
            first_run,
        ))
    }

    pub async fn snapshot(&self) -> GatewayConfig {
        self.inner.read().await.clone()
    }

    pub async fn provisioned(&self) -> bool {
        self.inner.read().await.provisioned
    }

    /// Apply `mutate` and persist the result.
    ///
    /// The in-memory config keeps the mutation even when persistence fails;
    /// the caller decides how loudly to report the lost durability.
    pub async fn update<F>(&self, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut GatewayConfig),
    {
        let mut config = self.inner.write().await;
        mutate(&mut config);
        self.store.write(CONFIG_NAME, &*config).await?;
        Ok(())
    }
}
