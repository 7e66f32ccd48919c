//! Two Hub Clients racing to become the Hub on a freshly claimed port must
//! converge on exactly one Hub, with both clients ending up connected.

use claude_chrome_mcp::operation::OperationManager;
use claude_chrome_mcp::{Config, HubClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

fn client_on(port: u16, ops_dir: &std::path::Path, name: &str) -> Arc<HubClient> {
    let mut config = Config::default();
    config.hub_port = port;
    let operations = Arc::new(OperationManager::new(ops_dir.join(format!("{name}-ops.json"))));
    std::env::set_var("CCM_CLIENT_NAME", name);
    HubClient::new(Arc::new(config), operations)
}

#[tokio::test]
async fn test_election_race_converges_on_one_hub() {
    let port = free_port().await;
    let ops_dir = tempfile::tempdir().unwrap();

    let client_a = client_on(port, ops_dir.path(), "client-a");
    let client_b = client_on(port, ops_dir.path(), "client-b");

    tokio::spawn(Arc::clone(&client_a).run());
    tokio::spawn(Arc::clone(&client_b).run());

    let deadline = Duration::from_secs(5);
    let both_connected = tokio::time::timeout(deadline, async {
        loop {
            if client_a.is_connected().await && client_b.is_connected().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    assert!(both_connected.is_ok(), "both clients should end up connected to a single hub");

    let id_a = client_a.peer_id().await;
    let id_b = client_b.peer_id().await;
    assert!(id_a.is_some());
    assert!(id_b.is_some());
    assert_ne!(id_a, id_b, "each host gets a distinct peer id from the hub");
}
