use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::SharedConfig;
use crate::net::NetworkJoin;
use crate::remote::Remote;
use crate::util::http::Uri;

/// Service the out-of-process pairing bridge advertises, with its two
/// characteristics: credentials accepts writes, status accepts reads.
pub const SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcdef0";
pub const CHAR_CREDENTIALS_UUID: &str = "12345678-1234-5678-1234-56789abcdef1";
pub const CHAR_STATUS_UUID: &str = "12345678-1234-5678-1234-56789abcdef2";

/// Provisioning status as exposed on the status characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Provisioned,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Provisioned => "provisioned",
        }
    }
}

/// Credentials payload written by the pairing peer.
///
/// Every field is optional; present fields merge into the stored config
/// before the join/register sequence runs. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct CredentialsPayload {
    name: Option<String>,

    #[serde(rename = "inviteCode")]
    invite_code: Option<String>,

    #[serde(rename = "apiBaseUrl", alias = "apiUrl")]
    api_endpoint: Option<Uri>,

    ssid: Option<String>,
    password: Option<String>,
}

/// How a single credentials write ended.
///
/// One write is one attempt. Every failure leaves the gateway waiting for
/// the peer to resend; nothing here is retried on our side.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Registration succeeded; the gateway is active.
    Provisioned,
    /// The payload did not decode; prior state is untouched.
    InvalidPayload,
    /// The network manager could not join the network; registration was
    /// never attempted.
    NetworkJoinFailed,
    /// The network step passed but the cloud rejected or was unreachable.
    /// Merged config fields are already persisted, so a retry only needs
    /// to resend the wifi credentials.
    RegistrationFailed,
}

/// The provisioning state machine.
///
/// There are two states, waiting and provisioned, projected from
/// `GatewayConfig.provisioned`. The only transition to provisioned is a
/// credentials write whose join and registration both succeed; the only
/// way back is the setup wizard.
pub struct Provisioner {
    config: SharedConfig,
    remote: Arc<Remote>,
    joiner: Box<dyn NetworkJoin>,

    // Held across the whole join+register sequence. Concurrent writes
    // queue here instead of interleaving their config mutations.
    write_guard: Mutex<()>,
}

impl Provisioner {
    pub fn new(
        config: SharedConfig,
        remote: Arc<Remote>,
        joiner: impl NetworkJoin + 'static,
    ) -> Self {
        Self {
            config,
            remote,
            joiner: Box::new(joiner),
            write_guard: Mutex::new(()),
        }
    }

    /// Current status, as read from the status characteristic. Reading has
    /// no side effects and is valid at any time, including before the
    /// first write.
    pub async fn status(&self) -> Status {
        if self.config.provisioned().await {
            Status::Provisioned
        } else {
            Status::Waiting
        }
    }

    /// Process one credentials write from the pairing peer.
    ///
    /// Nothing in here is fatal: malformed input, a failed join and a
    /// rejected registration all log, return an outcome and leave the
    /// process running.
    pub async fn handle_write(&self, raw: &[u8]) -> WriteOutcome {
        let _write = self.write_guard.lock().await;

        let payload: CredentialsPayload = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("undecodable credentials write: {err}");
                return WriteOutcome::InvalidPayload;
            }
        };

        // Merge plain config fields first. They stick even when the join
        // or the registration below fails, so a retry only has to resend
        // the wifi credentials.
        if let Err(err) = self
            .config
            .update(|config| {
                if let Some(name) = &payload.name {
                    config.device_name = name.clone();
                }
                if let Some(code) = &payload.invite_code {
                    config.invite_code = code.clone();
                }
                if let Some(endpoint) = &payload.api_endpoint {
                    config.api_endpoint = endpoint.clone();
                }
            })
            .await
        {
            error!("failed to persist merged credentials: {err}");
        }

        // Join the network when credentials are present. A write without
        // them, or with an empty password, skips straight to registration.
        let network_ok = match (&payload.ssid, &payload.password) {
            (Some(ssid), Some(password)) if !password.is_empty() => {
                info!("received wifi credentials for {ssid}");
                self.joiner.join(ssid, password).await
            }
            _ => true,
        };

        if !network_ok {
            warn!("wifi join failed, gateway stays unprovisioned");
            return WriteOutcome::NetworkJoinFailed;
        }

        let (invite_code, device_name) = {
            let config = self.config.snapshot().await;
            (config.invite_code, config.device_name)
        };

        if let Err(err) = self.remote.register(&invite_code, &device_name).await {
            warn!("cloud registration failed: {err}");
            return WriteOutcome::RegistrationFailed;
        }

        if let Err(err) = self.config.update(|config| config.provisioned = true).await {
            // The cloud knows this gateway either way; losing the flag on
            // disk means re-registering after the next restart.
            error!("failed to persist provisioned state: {err}");
        }

        info!("provisioning complete, gateway is active");
        WriteOutcome::Provisioned
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mockito::Server;
    use tempfile::TempDir;

    use crate::identity::DeviceId;
    use crate::util::store::Store;

    use super::*;

    struct StaticJoin {
        result: bool,
        calls: Arc<AtomicUsize>,
    }

    impl StaticJoin {
        fn new(result: bool) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    result,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl NetworkJoin for StaticJoin {
        async fn join(&self, _ssid: &str, _password: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    async fn provisioner_against(
        url: &str,
        dir: &TempDir,
        joiner: StaticJoin,
    ) -> (Provisioner, SharedConfig) {
        let (config, _) = SharedConfig::load(Store::new(dir.path())).await.unwrap();
        config
            .update(|config| config.api_endpoint = url.parse().unwrap())
            .await
            .unwrap();

        let remote = Arc::new(Remote::new(config.clone(), DeviceId::from("0xtest")));
        (
            Provisioner::new(config.clone(), remote, joiner),
            config,
        )
    }

    #[tokio::test]
    async fn a_valid_write_provisions_the_gateway() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/gateways/register")
            .with_status(200)
            .create_async()
            .await;

        let (joiner, join_calls) = StaticJoin::new(true);
        let (provisioner, config) = provisioner_against(&server.url(), &dir, joiner).await;

        assert_eq!(provisioner.status().await, Status::Waiting);

        let outcome = provisioner
            .handle_write(br#"{"ssid": "Net1", "password": "pw1", "inviteCode": "XYZ"}"#)
            .await;

        assert_eq!(outcome, WriteOutcome::Provisioned);
        assert_eq!(provisioner.status().await, Status::Provisioned);
        assert_eq!(join_calls.load(Ordering::SeqCst), 1);

        let snapshot = config.snapshot().await;
        assert!(snapshot.provisioned);
        assert_eq!(snapshot.invite_code, "XYZ");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_failed_join_never_reaches_registration() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/gateways/register")
            .expect(0)
            .create_async()
            .await;

        let (joiner, join_calls) = StaticJoin::new(false);
        let (provisioner, config) = provisioner_against(&server.url(), &dir, joiner).await;

        let outcome = provisioner
            .handle_write(br#"{"ssid": "Net1", "password": "wrong"}"#)
            .await;

        assert_eq!(outcome, WriteOutcome::NetworkJoinFailed);
        assert_eq!(provisioner.status().await, Status::Waiting);
        assert_eq!(join_calls.load(Ordering::SeqCst), 1);
        assert!(!config.snapshot().await.provisioned);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_rejected_registration_keeps_the_merged_fields() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/gateways/register")
            .with_status(403)
            .with_body("invalid invite code")
            .create_async()
            .await;

        let (joiner, _) = StaticJoin::new(true);
        let (provisioner, _) = provisioner_against(&server.url(), &dir, joiner).await;

        let outcome = provisioner
            .handle_write(
                br#"{"ssid": "Net1", "password": "pw1", "inviteCode": "XYZ", "name": "porch"}"#,
            )
            .await;

        assert_eq!(outcome, WriteOutcome::RegistrationFailed);
        assert_eq!(provisioner.status().await, Status::Waiting);

        // The merged fields survived on disk: a retry does not need to
        // resupply them.
        let (reloaded, _) = SharedConfig::load(Store::new(dir.path())).await.unwrap();
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.invite_code, "XYZ");
        assert_eq!(snapshot.device_name, "porch");
        assert!(!snapshot.provisioned);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn a_write_without_wifi_credentials_skips_the_join() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/gateways/register")
            .with_status(200)
            .create_async()
            .await;

        let (joiner, join_calls) = StaticJoin::new(true);
        let (provisioner, _) = provisioner_against(&server.url(), &dir, joiner).await;

        let outcome = provisioner
            .handle_write(br#"{"inviteCode": "XYZ"}"#)
            .await;

        assert_eq!(outcome, WriteOutcome::Provisioned);
        assert_eq!(join_calls.load(Ordering::SeqCst), 0);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn an_empty_password_counts_as_no_wifi_credentials() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let _mock = server
            .mock("POST", "/gateways/register")
            .with_status(200)
            .create_async()
            .await;

        let (joiner, join_calls) = StaticJoin::new(false);
        let (provisioner, _) = provisioner_against(&server.url(), &dir, joiner).await;

        let outcome = provisioner
            .handle_write(br#"{"ssid": "Net1", "password": ""}"#)
            .await;

        assert_eq!(outcome, WriteOutcome::Provisioned);
        assert_eq!(join_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_input_changes_nothing() {
        let mut server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let mock = server
            .mock("POST", "/gateways/register")
            .expect(0)
            .create_async()
            .await;

        let (joiner, join_calls) = StaticJoin::new(true);
        let (provisioner, config) = provisioner_against(&server.url(), &dir, joiner).await;
        let before = config.snapshot().await;

        let outcome = provisioner.handle_write(b"\xff\xfe not json").await;

        assert_eq!(outcome, WriteOutcome::InvalidPayload);
        assert_eq!(provisioner.status().await, Status::Waiting);
        assert_eq!(join_calls.load(Ordering::SeqCst), 0);

        let after = config.snapshot().await;
        assert_eq!(after.invite_code, before.invite_code);
        assert_eq!(after.device_name, before.device_name);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reading_status_repeatedly_is_idempotent() {
        let server = Server::new_async().await;
        let dir = TempDir::new().unwrap();

        let (joiner, _) = StaticJoin::new(true);
        let (provisioner, _) = provisioner_against(&server.url(), &dir, joiner).await;

        for _ in 0..3 {
            assert_eq!(provisioner.status().await, Status::Waiting);
        }
    }
}
