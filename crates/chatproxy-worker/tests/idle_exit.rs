//! Runs the real worker binary over OS pipes.

use std::sync::Arc;
use std::time::Duration;

use chatproxy::{
    ChannelConfig, ChatMessage, ChatSettings, LaunchParams, ProcessSpawner, ProxyClient,
    WorkerSpawner,
};
use chatproxy::host::spawner::WorkerHandle;
use serde_json::json;

fn spawner() -> ProcessSpawner {
    ProcessSpawner::new(env!("CARGO_BIN_EXE_chatproxy-worker"))
}

#[tokio::test]
async fn idle_worker_exits_while_stdin_is_open() {
    let params = LaunchParams {
        idle_timeout: Some(Duration::from_millis(200)),
        ..LaunchParams::default()
    };
    let mut worker = spawner().spawn(&params).unwrap();

    let mut exited = false;
    for _ in 0..100 {
        if worker.handle.has_exited() {
            exited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(exited, "worker still running 5s after its idle timeout");
    // Keep the host end of the pipe open until here.
    drop(worker.stdin);
}

#[tokio::test]
async fn client_respawns_idle_worker_and_reconnects() {
    let config = ChannelConfig::new(Arc::new(spawner())).with_idle_timeout(Duration::from_millis(200));
    let client = ProxyClient::new(config);
    let handle = client.connect("echo", json!({})).await.unwrap();
    let first = handle.connection_id().unwrap();

    let mut exited = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if client.channel().has_exited().await {
            exited = true;
            break;
        }
    }
    assert!(exited);

    let history = vec![ChatMessage::system("be brief"), ChatMessage::user("again")];
    let response = client.send_chat(&handle, history, ChatSettings::default()).await.unwrap();

    assert_eq!(response.message, ChatMessage::assistant("echo: again"));
    assert_ne!(handle.connection_id(), Some(first));
    assert_eq!(client.channel().generation().await, 2);
    client.shutdown(Duration::from_secs(2)).await.unwrap();
}
