//! Hub Client: a host's connection to the Hub.
//!
//! On startup a client first tries to connect to an existing Hub on the
//! configured loopback port. If nothing is listening, it races to bind the
//! port itself and becomes the Hub for every other client on the machine.
//! Either way the client then speaks the same [`crate::protocol::HostFrame`]
//! wire format to whichever Hub it ends up attached to.
//!
//! Reconnection uses capped exponential backoff; a connection that stays up
//! past `reconnect_quiet_secs` resets the backoff counter, so a flaky network
//! doesn't cause ever-growing delays once things stabilize.

use crate::config::Config;
use crate::error::BridgeError;
use crate::framing::JsonFrameDecoder;
use crate::hub::{BindOutcome, Hub};
use crate::operation::OperationManager;
use crate::protocol::{HostFrame, HubToHost};
use crate::ws::{self, WsMessage, WsWriter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, RwLock};

/// This process's resolved identity, used in `register_host` and logs.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Stable id for this process's connection, across reconnects.
    pub client_id: String,
    /// Display name: explicit override, else ancestry-detected editor name,
    /// else a generic fallback.
    pub name: String,
}

impl ClientIdentity {
    /// Resolves identity from environment overrides, falling back to
    /// process-ancestry detection.
    pub fn detect() -> Self {
        let client_id = crate::env::client_id_override().unwrap_or_else(|| {
            format!("host-{}", uuid::Uuid::new_v4())
        });
        let name = crate::env::client_name_override()
            .or_else(|| crate::process::detect_host_from_ancestry(6))
            .unwrap_or_else(|| "unknown-host".to_string());
        Self { client_id, name }
    }
}

/// How often this host sends a `keepalive` frame to the hub, independent of
/// the hub's own ping cadence (`hub_keepalive_interval_ms`).
const HOST_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive keepalive cycles with no frame from the hub before this host
/// gives up on the connection and forces a reconnect.
const MAX_MISSED_KEEPALIVES: u32 = 2;

struct PendingRequest {
    tx: oneshot::Sender<Result<serde_json::Value, BridgeError>>,
}

struct Connected {
    writer: Arc<Mutex<WsWriter>>,
    peer_id: String,
}

/// A host's live connection to the hub fabric. Handles election, routes
/// outgoing requests, and dispatches incoming frames to waiters.
pub struct HubClient {
    config: Arc<Config>,
    operations: Arc<OperationManager>,
    identity: ClientIdentity,
    connected: RwLock<Option<Arc<Connected>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    request_seq: AtomicU64,
    /// Kept alive only when this process elected itself the Hub.
    owned_hub: Mutex<Option<Hub>>,
}

impl HubClient {
    /// Builds a client. Does not connect; call [`Self::run`] to start the
    /// connect/reconnect loop in the background.
    pub fn new(config: Arc<Config>, operations: Arc<OperationManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            operations,
            identity: ClientIdentity::detect(),
            connected: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            request_seq: AtomicU64::new(0),
            owned_hub: Mutex::new(None),
        })
    }

    /// Runs the connect/reconnect loop until the process exits. Intended to
    /// be spawned as a background task.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
        );

        loop {
            let connected_at = Instant::now();
            match self.connect_once().await {
                Ok(()) => {
                    log::info!("hub client: connection to hub ended");
                }
                Err(e) => {
                    log::warn!("hub client: connection attempt failed: {e:#}");
                }
            }

            self.fail_all_pending(|| BridgeError::ConnectionLost).await;
            *self.connected.write().await = None;

            if connected_at.elapsed() >= Duration::from_secs(self.config.reconnect_quiet_secs) {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            log::info!("hub client: reconnecting in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }

    /// One election + connect + read-loop cycle. Returns when the
    /// connection drops (`Ok`) or a fatal setup error occurs (`Err`).
    async fn connect_once(self: &Arc<Self>) -> anyhow::Result<()> {
        let url = format!("ws://127.0.0.1:{}", self.config.hub_port);

        let (mut writer, mut reader) = match ws::connect(&url, &[]).await {
            Ok(pair) => pair,
            Err(_) if crate::env::no_auto_hub() => {
                anyhow::bail!("no hub listening and CCM_NO_AUTO_HUB forbids creating one")
            }
            Err(_) => self.elect_and_connect(&url).await?,
        };

        let writer = Arc::new(Mutex::new(writer));
        {
            let mut w = writer.lock().await;
            w.send_text(&serde_json::to_string(&HostFrame::RegisterHost {
                client_id: Some(self.identity.client_id.clone()),
                name: Some(self.identity.name.clone()),
            })?)
            .await?;
        }

        let mut decoder = JsonFrameDecoder::new();
        let mut peer_id: Option<String> = None;
        let mut keepalive = tokio::time::interval(HOST_KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately
        let mut missed_keepalives: u32 = 0;

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if missed_keepalives >= MAX_MISSED_KEEPALIVES {
                        log::warn!("hub client: missed {missed_keepalives} keepalive cycles, forcing reconnect");
                        break;
                    }
                    let line = serde_json::to_string(&HostFrame::Keepalive)?;
                    let mut w = writer.lock().await;
                    if w.send_text(&line).await.is_err() {
                        break;
                    }
                    drop(w);
                    missed_keepalives += 1;
                }
                msg = reader.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match msg {
                        Ok(WsMessage::Text(t)) => t,
                        Ok(WsMessage::Ping(payload)) => {
                            let mut w = writer.lock().await;
                            let _ = w.send_pong(payload).await;
                            missed_keepalives = 0;
                            continue;
                        }
                        Ok(WsMessage::Pong(_) | WsMessage::Binary(_)) => {
                            missed_keepalives = 0;
                            continue;
                        }
                        Ok(WsMessage::Close { .. }) => break,
                        Err(e) => return Err(e),
                    };
                    missed_keepalives = 0;

                    for frame in decoder.feed(&text)? {
                        let frame: HubToHost = match serde_json::from_value(frame) {
                            Ok(f) => f,
                            Err(e) => {
                                log::debug!("hub client: ignoring unrecognized frame: {e}");
                                continue;
                            }
                        };

                        match frame {
                            HubToHost::RegistrationAck { peer_id: id } => {
                                peer_id = Some(id.clone());
                                *self.connected.write().await = Some(Arc::new(Connected {
                                    writer: Arc::clone(&writer),
                                    peer_id: id,
                                }));
                                log::info!("hub client: registered as {}", self.identity.client_id);
                            }
                            HubToHost::Response { request_id, result } => {
                                self.resolve_pending(&request_id, Ok(result)).await;
                            }
                            HubToHost::Error { request_id, error, kind } => {
                                let err = kind
                                    .as_deref()
                                    .map(|k| upstream_error_for_kind(k, &error))
                                    .unwrap_or(BridgeError::Upstream { message: error });
                                self.resolve_pending(&request_id, Err(err)).await;
                            }
                            HubToHost::Milestone { operation_id, label, data } => {
                                if let Err(e) = self.operations.update(&operation_id, &label, data).await {
                                    log::debug!("hub client: milestone for unknown operation: {e}");
                                }
                            }
                            HubToHost::KeepaliveAck => {}
                            HubToHost::HubShutdown => {
                                log::info!("hub client: hub announced shutdown");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        let _ = peer_id;
        Ok(())
    }

    async fn elect_and_connect(self: &Arc<Self>, url: &str) -> anyhow::Result<(WsWriter, ws::WsReader)> {
        if crate::env::force_hub_creation() {
            return self.become_hub_then_connect(url).await;
        }

        match Hub::try_bind(Arc::clone(&self.config), Arc::clone(&self.operations)).await? {
            BindOutcome::Bound(hub) => {
                *self.owned_hub.lock().await = Some(hub);
                ws::connect(url, &[]).await
            }
            BindOutcome::AddressInUse => {
                // Someone else won the race between our failed connect and
                // our bind attempt; just connect to them.
                ws::connect(url, &[]).await
            }
        }
    }

    async fn become_hub_then_connect(self: &Arc<Self>, url: &str) -> anyhow::Result<(WsWriter, ws::WsReader)> {
        match Hub::try_bind(Arc::clone(&self.config), Arc::clone(&self.operations)).await? {
            BindOutcome::Bound(hub) => {
                *self.owned_hub.lock().await = Some(hub);
            }
            BindOutcome::AddressInUse => {}
        }
        ws::connect(url, &[]).await
    }

    /// Sends a request to the extension and waits for its response, or for
    /// `timeout_ms` to elapse.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, BridgeError> {
        let connected = self
            .connected
            .read()
            .await
            .clone()
            .ok_or(BridgeError::NotConnected)?;

        let request_id = format!("req_{}", self.request_seq.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request_id.clone(), PendingRequest { tx });

        let frame = HostFrame::Request {
            request_id: request_id.clone(),
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&frame).map_err(|e| BridgeError::Internal(e.into()))?;

        {
            let mut writer = connected.writer.lock().await;
            if writer.send_text(&line).await.is_err() {
                self.pending.lock().await.remove(&request_id);
                return Err(BridgeError::ConnectionLost);
            }
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(BridgeError::Timeout { elapsed_ms: timeout_ms })
            }
        }
    }

    /// `true` once a `registration_ack` has been received on the current
    /// connection.
    pub async fn is_connected(&self) -> bool {
        self.connected.read().await.is_some()
    }

    /// The peer id this process was assigned by the hub, if connected.
    pub async fn peer_id(&self) -> Option<String> {
        self.connected.read().await.as_ref().map(|c| c.peer_id.clone())
    }

    /// The `Hub` this process elected itself to own, if it won election.
    /// Processes that connected to someone else's hub get `None`.
    pub async fn owned_hub(&self) -> Option<Hub> {
        self.owned_hub.lock().await.clone()
    }

    async fn resolve_pending(&self, request_id: &str, result: Result<serde_json::Value, BridgeError>) {
        if let Some(pending) = self.pending.lock().await.remove(request_id) {
            let _ = pending.tx.send(result);
        }
    }

    async fn fail_all_pending(&self, make_err: impl Fn() -> BridgeError + Copy) {
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.tx.send(Err(make_err()));
        }
    }
}

fn upstream_error_for_kind(kind: &str, message: &str) -> BridgeError {
    match kind {
        "not_found" => BridgeError::NotFound { what: message.to_string() },
        "busy" => BridgeError::Busy { resource: message.to_string() },
        "timeout" => BridgeError::Timeout { elapsed_ms: 0 },
        "no_extension" => BridgeError::NoExtension,
        "validation" => BridgeError::Validation { message: message.to_string() },
        _ => BridgeError::Upstream { message: message.to_string() },
    }
}

/// Capped exponential backoff with a reset hook for "stayed up a while."
struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(20));
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt += 1;
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_at_max() {
        let mut b = Backoff::new(250, 2_000);
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = b.next_delay();
        }
        assert_eq!(last, Duration::from_millis(2_000));
    }

    #[test]
    fn test_backoff_reset_returns_to_base() {
        let mut b = Backoff::new(100, 10_000);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_upstream_error_for_kind_maps_known_kinds() {
        assert!(matches!(
            upstream_error_for_kind("not_found", "tab 1"),
            BridgeError::NotFound { .. }
        ));
        assert!(matches!(
            upstream_error_for_kind("mystery", "x"),
            BridgeError::Upstream { .. }
        ));
    }

    #[test]
    fn test_client_identity_detect_does_not_panic() {
        let id = ClientIdentity::detect();
        assert!(!id.client_id.is_empty());
    }
}
