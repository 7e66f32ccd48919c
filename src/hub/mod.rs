//! The Hub: one routing fabric per loopback port.
//!
//! Accepts at most one `extension` peer and any number of `host` peers,
//! forwards `request`s from hosts to the extension, and routes the
//! extension's `response`/`error`/`milestone` frames back to the
//! originating host. See [`crate::protocol`] for the frame shapes and
//! [`crate::framing`] for the wire-level JSON accumulation.

mod peer;

pub use peer::{Peer, PeerSnapshot};

use crate::config::Config;
use crate::framing::JsonFrameDecoder;
use crate::operation::OperationManager;
use crate::protocol::{ExtensionFrame, HostFrame, HubToExtension, HubToHost, PeerKind};
use crate::ws::{self, WsMessage};
use peer::OutboundFrame;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Outcome of attempting to bind the Hub's loopback port.
pub enum BindOutcome {
    /// This process now owns the Hub.
    Bound(Hub),
    /// Something else already owns the port; the caller should connect as
    /// a host instead of racing further.
    AddressInUse,
}

struct HubState {
    extension: Option<Peer>,
    hosts: HashMap<String, Peer>,
}

impl HubState {
    fn peer_count(&self) -> usize {
        self.hosts.len() + usize::from(self.extension.is_some())
    }

    fn snapshot_peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self.hosts.values().map(Peer::snapshot).collect();
        if let Some(ext) = &self.extension {
            peers.push(ext.snapshot());
        }
        peers
    }
}

/// The Hub's routing fabric. Cheap to clone; all state lives behind an
/// `Arc<Mutex<_>>` shared with the connection tasks it spawns.
#[derive(Clone)]
pub struct Hub {
    config: Arc<Config>,
    state: Arc<Mutex<HubState>>,
    operations: Arc<OperationManager>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Arc<Mutex<mpsc::Receiver<()>>>,
    /// Cancelled to stop the accept loop from taking new connections.
    accept_cancel: CancellationToken,
}

impl Hub {
    /// Attempts to bind the Hub's loopback port. Returns
    /// [`BindOutcome::AddressInUse`] instead of an error when the port is
    /// already taken, since that's an expected outcome during election
    /// (see the hub client).
    pub async fn try_bind(config: Arc<Config>, operations: Arc<OperationManager>) -> anyhow::Result<BindOutcome> {
        let addr = format!("127.0.0.1:{}", config.hub_port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
                let hub = Hub {
                    config,
                    state: Arc::new(Mutex::new(HubState {
                        extension: None,
                        hosts: HashMap::new(),
                    })),
                    operations,
                    shutdown_tx,
                    shutdown_rx: Arc::new(Mutex::new(shutdown_rx)),
                    accept_cancel: CancellationToken::new(),
                };
                hub.clone().spawn_accept_loop(listener);
                hub.clone().spawn_health_sweep();
                Ok(BindOutcome::Bound(hub))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(BindOutcome::AddressInUse),
            Err(e) => Err(e.into()),
        }
    }

    fn spawn_accept_loop(self, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = self.accept_cancel.cancelled() => {
                        log::info!("hub: accept loop stopping");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                log::debug!("hub: accepted connection from {addr}");
                                let hub = self.clone();
                                let cancel = CancellationToken::new();
                                tokio::spawn(async move {
                                    if let Err(e) = hub.handle_connection(stream, cancel).await {
                                        log::debug!("hub: connection ended: {e:#}");
                                    }
                                });
                            }
                            Err(e) => {
                                log::warn!("hub: accept failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_health_sweep(self) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                self.config.hub_keepalive_interval_ms,
            ));
            loop {
                interval.tick().await;
                self.ping_all_peers().await;
                self.sweep_inactive_peers().await;
                if self.config.hub_auto_drain {
                    let empty = self.state.lock().await.peer_count() == 0;
                    if empty {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        let still_empty = self.state.lock().await.peer_count() == 0;
                        if still_empty {
                            log::info!("hub: draining, no peers for 5s grace period");
                            let _ = self.shutdown_tx.send(()).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Sends a liveness ping to every connected peer. A peer that never
    /// answers (no frame of any kind, including the automatic pong) within
    /// two sweep intervals is force-closed by [`Self::sweep_inactive_peers`].
    async fn ping_all_peers(&self) {
        let state = self.state.lock().await;
        if let Some(ext) = &state.extension {
            ext.send_ping();
        }
        for host in state.hosts.values() {
            host.send_ping();
        }
    }

    async fn sweep_inactive_peers(&self) {
        let limit = Duration::from_millis(self.config.hub_keepalive_interval_ms) * 2;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.hosts.retain(|id, peer| {
            let alive = now.duration_since(peer.last_activity) < limit;
            if !alive {
                log::info!("hub: force-closing inactive host {id} (missed pong)");
                peer.cancel.cancel();
            }
            alive
        });
        if let Some(ext) = &state.extension {
            if now.duration_since(ext.last_activity) >= limit {
                log::info!("hub: force-closing inactive extension (missed pong)");
                ext.cancel.cancel();
                state.extension = None;
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, cancel: CancellationToken) -> anyhow::Result<()> {
        let (mut writer, mut reader) = ws::accept(stream).await?;
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<OutboundFrame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                let result = match frame {
                    OutboundFrame::Text(line) => writer.send_text(&line).await,
                    OutboundFrame::Ping => writer.send_ping(Vec::new()).await,
                    OutboundFrame::Pong(data) => writer.send_pong(data).await,
                };
                if result.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let mut decoder = JsonFrameDecoder::new();
        let peer_id = uuid::Uuid::new_v4().to_string();
        let mut registered_kind: Option<PeerKind> = None;

        'conn: loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break 'conn,
                msg = reader.recv() => msg,
            };
            let Some(msg) = msg else { break 'conn };

            let text = match msg {
                Ok(WsMessage::Text(t)) => t,
                Ok(WsMessage::Ping(payload)) => {
                    let _ = outbox_tx.send(OutboundFrame::Pong(payload));
                    continue;
                }
                Ok(WsMessage::Pong(_)) => {
                    if let Some(kind) = registered_kind {
                        self.touch(&peer_id, kind).await;
                    }
                    continue;
                }
                Ok(WsMessage::Close { .. }) | Err(_) => break,
                Ok(WsMessage::Binary(_)) => continue,
            };

            let frames = match decoder.feed(&text) {
                Ok(f) => f,
                Err(e) => {
                    log::debug!("hub: dropping malformed frame from {peer_id}: {e}");
                    continue;
                }
            };

            for frame in frames {
                if registered_kind.is_none() {
                    match self.register(&peer_id, frame, &outbox_tx, &cancel).await {
                        Ok(kind) => registered_kind = Some(kind),
                        Err(e) => {
                            log::debug!("hub: rejecting connection {peer_id}: {e}");
                            break 'conn;
                        }
                    }
                    continue;
                }

                self.route(&peer_id, registered_kind.expect("set above"), frame)
                    .await;
            }
        }

        self.unregister(&peer_id, registered_kind).await;
        outbox_tx.closed().await;
        writer_task.abort();
        Ok(())
    }

    async fn register(
        &self,
        peer_id: &str,
        frame: serde_json::Value,
        outbox: &mpsc::UnboundedSender<OutboundFrame>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PeerKind> {
        let frame_type = frame.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match frame_type {
            "register_extension" => {
                let mut state = self.state.lock().await;
                if let Some(old) = state.extension.take() {
                    old.send_line(serde_json::to_string(&HubToHost::HubShutdown)?);
                    old.cancel.cancel();
                    log::info!("hub: replacing existing extension peer {}", old.id);
                }
                let peer = Peer {
                    id: peer_id.to_string(),
                    kind: PeerKind::Extension,
                    name: None,
                    outbox: outbox.clone(),
                    last_activity: Instant::now(),
                    cancel: cancel.clone(),
                };
                peer.send_line(serde_json::to_string(&HubToExtension::RegistrationAck {
                    peer_id: peer_id.to_string(),
                })?);
                state.extension = Some(peer);
                drop(state);
                self.emit_event("extension_connected", json!({"peer_id": peer_id}))
                    .await;
                Ok(PeerKind::Extension)
            }
            "register_host" => {
                let name = frame.get("name").and_then(|v| v.as_str()).map(String::from);
                let mut state = self.state.lock().await;
                let peer = Peer {
                    id: peer_id.to_string(),
                    kind: PeerKind::Host,
                    name,
                    outbox: outbox.clone(),
                    last_activity: Instant::now(),
                    cancel: cancel.clone(),
                };
                peer.send_line(serde_json::to_string(&HubToHost::RegistrationAck {
                    peer_id: peer_id.to_string(),
                })?);
                state.hosts.insert(peer_id.to_string(), peer);
                drop(state);
                self.emit_event("client_joined", json!({"peer_id": peer_id})).await;
                Ok(PeerKind::Host)
            }
            other => anyhow::bail!("first frame must be a registration frame, got {other:?}"),
        }
    }

    async fn unregister(&self, peer_id: &str, kind: Option<PeerKind>) {
        let mut state = self.state.lock().await;
        match kind {
            Some(PeerKind::Extension) => {
                if state.extension.as_ref().is_some_and(|e| e.id == peer_id) {
                    state.extension = None;
                    drop(state);
                    self.emit_event("extension_disconnected", json!({"peer_id": peer_id}))
                        .await;
                }
            }
            Some(PeerKind::Host) => {
                if state.hosts.remove(peer_id).is_some() {
                    drop(state);
                    self.emit_event("client_left", json!({"peer_id": peer_id})).await;
                }
            }
            None => {}
        }
    }

    async fn route(&self, peer_id: &str, kind: PeerKind, frame: serde_json::Value) {
        match kind {
            PeerKind::Host => self.route_from_host(peer_id, frame).await,
            PeerKind::Extension => self.route_from_extension(frame).await,
        }
        self.touch(peer_id, kind).await;
    }

    async fn route_from_host(&self, peer_id: &str, frame: serde_json::Value) {
        let parsed: Result<HostFrame, _> = serde_json::from_value(frame.clone());
        match parsed {
            Ok(HostFrame::Request {
                request_id,
                method,
                params,
            }) => {
                let state = self.state.lock().await;
                if let Some(ext) = &state.extension {
                    let routed = HubToExtension::Request {
                        request_id,
                        method,
                        params,
                        origin_peer_id: peer_id.to_string(),
                    };
                    if let Ok(line) = serde_json::to_string(&routed) {
                        ext.send_line(line);
                    }
                } else if let Some(host) = state.hosts.get(peer_id) {
                    let err = HubToHost::Error {
                        request_id,
                        error: "no extension peer registered".to_string(),
                        kind: Some("no_extension".to_string()),
                    };
                    if let Ok(line) = serde_json::to_string(&err) {
                        host.send_line(line);
                    }
                }
            }
            Ok(HostFrame::Keepalive) => {
                let state = self.state.lock().await;
                if let Some(host) = state.hosts.get(peer_id) {
                    if let Ok(line) = serde_json::to_string(&HubToHost::KeepaliveAck) {
                        host.send_line(line);
                    }
                }
            }
            Ok(HostFrame::RegisterHost { .. }) => {
                // Already registered; a repeat registration frame is ignored.
            }
            Err(_) => {
                // Unrecognized type: forward as a request if it carries a
                // request_id, per the Hub's extensibility rule.
                if let Some(request_id) = frame.get("request_id").and_then(|v| v.as_str()) {
                    let method = frame
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let state = self.state.lock().await;
                    if let Some(ext) = &state.extension {
                        let routed = HubToExtension::Request {
                            request_id: request_id.to_string(),
                            method,
                            params: frame,
                            origin_peer_id: peer_id.to_string(),
                        };
                        if let Ok(line) = serde_json::to_string(&routed) {
                            ext.send_line(line);
                        }
                    }
                } else {
                    log::warn!("hub: dropping unrecognized frame from host {peer_id} (no request_id)");
                }
            }
        }
    }

    async fn route_from_extension(&self, frame: serde_json::Value) {
        let parsed: Result<ExtensionFrame, _> = serde_json::from_value(frame);
        match parsed {
            Ok(ExtensionFrame::Response {
                request_id,
                target_peer_id,
                result,
            }) => {
                let state = self.state.lock().await;
                if let Some(host) = state.hosts.get(&target_peer_id) {
                    let msg = HubToHost::Response { request_id, result };
                    if let Ok(line) = serde_json::to_string(&msg) {
                        host.send_line(line);
                    }
                } else {
                    log::debug!("hub: dropping response for disconnected host {target_peer_id}");
                }
            }
            Ok(ExtensionFrame::Error {
                request_id,
                target_peer_id,
                error,
                kind,
            }) => {
                let state = self.state.lock().await;
                if let Some(host) = state.hosts.get(&target_peer_id) {
                    let msg = HubToHost::Error { request_id, error, kind };
                    if let Ok(line) = serde_json::to_string(&msg) {
                        host.send_line(line);
                    }
                }
            }
            Ok(ExtensionFrame::Milestone {
                operation_id,
                label,
                data,
            }) => {
                if let Err(e) = self.operations.update(&operation_id, &label, data.clone()).await {
                    log::debug!("hub: milestone for unknown operation {operation_id}: {e}");
                }
                let msg = HubToHost::Milestone {
                    operation_id,
                    label,
                    data,
                };
                self.broadcast_to_hosts(&msg).await;
            }
            Ok(ExtensionFrame::Keepalive) => {
                let state = self.state.lock().await;
                if let Some(ext) = &state.extension {
                    if let Ok(line) = serde_json::to_string(&HubToExtension::KeepaliveAck) {
                        ext.send_line(line);
                    }
                }
            }
            Ok(ExtensionFrame::Event { .. } | ExtensionFrame::RegisterExtension { .. }) => {}
            Err(e) => log::warn!("hub: unrecognized frame from extension: {e}"),
        }
    }

    async fn broadcast_to_hosts(&self, msg: &HubToHost) {
        let Ok(line) = serde_json::to_string(msg) else {
            return;
        };
        let state = self.state.lock().await;
        for host in state.hosts.values() {
            host.send_line(line.clone());
        }
    }

    async fn touch(&self, peer_id: &str, kind: PeerKind) {
        let mut state = self.state.lock().await;
        match kind {
            PeerKind::Host => {
                if let Some(host) = state.hosts.get_mut(peer_id) {
                    host.last_activity = Instant::now();
                }
            }
            PeerKind::Extension => {
                if let Some(ext) = &mut state.extension {
                    ext.last_activity = Instant::now();
                }
            }
        }
    }

    async fn emit_event(&self, name: &str, data: serde_json::Value) {
        let state = self.state.lock().await;
        let Some(ext) = &state.extension else { return };
        let event = HubToExtension::Event {
            name: name.to_string(),
            data: json!({"peers": state.snapshot_peers(), "detail": data}),
        };
        if let Ok(line) = serde_json::to_string(&event) {
            ext.send_line(line);
        }
    }

    /// Initiates the bounded shutdown sequence: stop accepting new
    /// connections, notify every peer, then force-close every connection.
    pub async fn shutdown(&self) {
        self.accept_cancel.cancel();

        let state = self.state.lock().await;
        if let Some(ext) = &state.extension {
            if let Ok(line) = serde_json::to_string(&HubToExtension::HubShutdown) {
                ext.send_line(line);
            }
        }
        for host in state.hosts.values() {
            if let Ok(line) = serde_json::to_string(&HubToHost::HubShutdown) {
                host.send_line(line);
            }
        }
        drop(state);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = self.state.lock().await;
        if let Some(ext) = &state.extension {
            ext.cancel.cancel();
        }
        for host in state.hosts.values() {
            host.cancel.cancel();
        }
    }

    /// Blocks until the Hub decides to shut down on its own (auto-drain).
    /// Callers that want to shut down on an external signal should call
    /// [`Self::shutdown`] directly instead.
    pub async fn wait_for_drain(&self) {
        let mut rx = self.shutdown_rx.lock().await;
        let _ = rx.recv().await;
    }

    /// Number of currently registered peers, for tests and status reporting.
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peer_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_on_free_port() -> (Hub, u16) {
        // Bind a throwaway listener first to claim a free ephemeral port,
        // then immediately drop it and reuse the port number for the Hub.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = Config::default();
        config.hub_port = port;
        let config = Arc::new(config);
        let ops_dir = tempfile::tempdir().unwrap();
        let operations = Arc::new(OperationManager::new(ops_dir.path().join("ops.json")));

        match Hub::try_bind(config, operations).await.unwrap() {
            BindOutcome::Bound(hub) => (hub, port),
            BindOutcome::AddressInUse => panic!("port should have been free"),
        }
    }

    #[tokio::test]
    async fn test_bind_twice_second_is_address_in_use() {
        let (_hub, port) = bind_on_free_port().await;
        let mut config = Config::default();
        config.hub_port = port;
        let ops_dir = tempfile::tempdir().unwrap();
        let operations = Arc::new(OperationManager::new(ops_dir.path().join("ops.json")));

        let outcome = Hub::try_bind(Arc::new(config), operations).await.unwrap();
        assert!(matches!(outcome, BindOutcome::AddressInUse));
    }

    #[tokio::test]
    async fn test_host_connects_and_registers() {
        let (hub, port) = bind_on_free_port().await;
        let url = format!("ws://127.0.0.1:{port}");
        let (mut writer, mut reader) = ws::connect(&url, &[]).await.unwrap();

        writer
            .send_text(r#"{"type":"register_host","client_id":null,"name":"test-host"}"#)
            .await
            .unwrap();

        let msg = reader.recv().await.unwrap().unwrap();
        match msg {
            WsMessage::Text(t) => assert!(t.contains("registration_ack")),
            other => panic!("unexpected message: {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_request_without_extension_gets_no_extension_error() {
        let (_hub, port) = bind_on_free_port().await;
        let url = format!("ws://127.0.0.1:{port}");
        let (mut writer, mut reader) = ws::connect(&url, &[]).await.unwrap();

        writer
            .send_text(r#"{"type":"register_host"}"#)
            .await
            .unwrap();
        let _ack = reader.recv().await.unwrap().unwrap();

        writer
            .send_text(r#"{"type":"request","request_id":"r1","method":"ping","params":{}}"#)
            .await
            .unwrap();

        let msg = reader.recv().await.unwrap().unwrap();
        match msg {
            WsMessage::Text(t) => {
                assert!(t.contains("no_extension"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_and_closes_peers() {
        let (hub, port) = bind_on_free_port().await;
        let url = format!("ws://127.0.0.1:{port}");
        let (mut writer, mut reader) = ws::connect(&url, &[]).await.unwrap();
        writer
            .send_text(r#"{"type":"register_host"}"#)
            .await
            .unwrap();
        let _ack = reader.recv().await.unwrap().unwrap();

        hub.shutdown().await;

        let msg = reader.recv().await.unwrap().unwrap();
        match msg {
            WsMessage::Text(t) => assert!(t.contains("hub_shutdown")),
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(TcpListener::bind(format!("127.0.0.1:{port}")).await.is_ok());
    }
}
