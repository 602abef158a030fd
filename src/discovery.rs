use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::remote::Remote;

/// Topic the out-of-process bus bridge subscribes to on the local broker.
pub const DISCOVERY_TOPIC: &str = "discovery/announce";

/// What became of one bus message.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// First sighting, forwarded to the cloud.
    Forwarded,
    /// First sighting, but the cloud call failed. The id stays recorded;
    /// there is no second attempt until the process restarts.
    ForwardFailed,
    /// Already seen this process lifetime.
    Duplicate,
    /// First sighting while unprovisioned; recorded but not forwarded.
    NotProvisioned,
    /// Not JSON, or no usable `id` field.
    Invalid,
}

/// Deduplicates device announcements and relays new ones to the cloud.
///
/// The seen-set is memory only: a restart clears it and every device is
/// re-forwarded exactly once more.
pub struct Deduper {
    config: SharedConfig,
    remote: Arc<Remote>,
    seen: Mutex<HashSet<String>>,
}

impl Deduper {
    pub fn new(config: SharedConfig, remote: Arc<Remote>) -> Self {
        Self {
            config,
            remote,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Handle one raw message from the discovery topic.
    ///
    /// Messages that do not decode or carry no `id` are dropped without a
    /// trace beyond a debug line. Each distinct id gets at most one
    /// forward attempt per process lifetime.
    pub async fn handle_message(&self, raw: &[u8]) -> DispatchOutcome {
        let payload: Value = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(err) => {
                debug!("dropping undecodable discovery message: {err}");
                return DispatchOutcome::Invalid;
            }
        };

        let Some(id) = payload.get("id").and_then(Value::as_str).map(str::to_owned) else {
            debug!("dropping discovery message without an id");
            return DispatchOutcome::Invalid;
        };

        // Inserting decides the forward: whichever delivery gets the id
        // into the set owns the single attempt for it.
        let first_sighting = {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            seen.insert(id.clone())
        };

        if !first_sighting {
            debug!("already seen {id}");
            return DispatchOutcome::Duplicate;
        }

        info!("new device {id}");

        if !self.config.provisioned().await {
            debug!("not provisioned, skipping cloud sync for {id}");
            return DispatchOutcome::NotProvisioned;
        }

        let device_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();

        match self.remote.submit(&id, &device_type, &payload).await {
            Ok(()) => {
                info!("forwarded {id} to the cloud");
                DispatchOutcome::Forwarded
            }
            Err(err) => {
                warn!("forwarding {id} failed: {err}");
                DispatchOutcome::ForwardFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mockito::Server;
    use tempfile::TempDir;

    use crate::identity::DeviceId;
    use crate::util::store::Store;

    use super::*;

    async fn deduper_against(url: &str, dir: &TempDir, provisioned: bool) -> Deduper {
        let (config, _) = SharedConfig::load(Store::new(dir.path())).await.unwrap();
        config
            .update(|config| {
                config.api_endpoint = url.parse().unwrap();
                config.provisioned = provisioned;
            })
            .await
            .unwrap();

        let remote = Arc::new(Remote::new(config.clone(), DeviceId::from("0xtest")));
        Deduper::new(config, remote)
    }

    #[tokio::test]
    async fn forwards_each_id_exactly_once() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/devices")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let deduper = deduper_against(&server.url(), &dir, true).await;

        let outcomes = [
            deduper.handle_message(br#"{"id": "A"}"#).await,
            deduper.handle_message(br#"{"id": "A"}"#).await,
            deduper.handle_message(br#"{"id": "B"}"#).await,
            deduper.handle_message(br#"{"id": "A"}"#).await,
        ];

        assert_eq!(
            outcomes,
            [
                DispatchOutcome::Forwarded,
                DispatchOutcome::Duplicate,
                DispatchOutcome::Forwarded,
                DispatchOutcome::Duplicate,
            ]
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn records_but_never_forwards_while_unprovisioned() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/devices")
            .expect(0)
            .create_async()
            .await;

        let deduper = deduper_against(&server.url(), &dir, false).await;

        let outcomes = [
            deduper.handle_message(br#"{"id": "A"}"#).await,
            deduper.handle_message(br#"{"id": "A"}"#).await,
            deduper.handle_message(br#"{"id": "B"}"#).await,
            deduper.handle_message(br#"{"id": "A"}"#).await,
        ];

        assert_eq!(
            outcomes,
            [
                DispatchOutcome::NotProvisioned,
                DispatchOutcome::Duplicate,
                DispatchOutcome::NotProvisioned,
                DispatchOutcome::Duplicate,
            ]
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn provisioning_later_does_not_retroactively_forward() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/devices")
            .expect(0)
            .create_async()
            .await;

        let deduper = deduper_against(&server.url(), &dir, false).await;
        assert_eq!(
            deduper.handle_message(br#"{"id": "A"}"#).await,
            DispatchOutcome::NotProvisioned
        );

        deduper
            .config
            .update(|config| config.provisioned = true)
            .await
            .unwrap();

        // A was recorded during the unprovisioned sighting, so it stays
        // suppressed.
        assert_eq!(
            deduper.handle_message(br#"{"id": "A"}"#).await,
            DispatchOutcome::Duplicate
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_failed_forward_burns_the_id() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/devices")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let deduper = deduper_against(&server.url(), &dir, true).await;

        assert_eq!(
            deduper.handle_message(br#"{"id": "A"}"#).await,
            DispatchOutcome::ForwardFailed
        );
        assert_eq!(
            deduper.handle_message(br#"{"id": "A"}"#).await,
            DispatchOutcome::Duplicate
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn drops_messages_without_an_id_or_without_json() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/devices")
            .expect(0)
            .create_async()
            .await;

        let deduper = deduper_against(&server.url(), &dir, true).await;

        assert_eq!(
            deduper.handle_message(b"garbage").await,
            DispatchOutcome::Invalid
        );
        assert_eq!(
            deduper.handle_message(br#"{"type": "sensor"}"#).await,
            DispatchOutcome::Invalid
        );
        assert_eq!(
            deduper.handle_message(br#"{"id": 42}"#).await,
            DispatchOutcome::Invalid
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_missing_type_defaults_to_unknown() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/devices")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "identifier": "A",
                "type": "unknown",
            })))
            .with_status(200)
            .create_async()
            .await;

        let deduper = deduper_against(&server.url(), &dir, true).await;
        assert_eq!(
            deduper.handle_message(br#"{"id": "A"}"#).await,
            DispatchOutcome::Forwarded
        );

        mock.assert_async().await;
    }
}
