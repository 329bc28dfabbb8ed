#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use framewire::{
    ChannelState, Endpoint, FramedClient, FramedServer, NetworkConfig, ServerEvent, SocketEvent,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn local_config() -> NetworkConfig {
    NetworkConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        ..NetworkConfig::default()
    }
}

pub struct TestServer {
    pub server: Arc<FramedServer>,
    pub addr: SocketAddr,
    pub notify_shutdown: broadcast::Sender<()>,
    pub shutdown_complete_rx: mpsc::Receiver<()>,
    pub run_task: JoinHandle<()>,
}

pub async fn start_server(config: NetworkConfig) -> TestServer {
    let endpoint = Endpoint::from_config(&config);
    let listener = endpoint.listen(config.backlog).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    let server = Arc::new(FramedServer::new(
        listener,
        config,
        notify_shutdown.clone(),
        shutdown_complete_tx,
    ));
    let run_task = tokio::spawn({
        let server = server.clone();
        async move {
            let _ = server.run().await;
        }
    });
    TestServer {
        server,
        addr,
        notify_shutdown,
        shutdown_complete_rx,
        run_task,
    }
}

impl TestServer {
    /// Echoes every Full-mode message back on the connection it came from.
    pub fn spawn_echo(&self) {
        let events = self.server.events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let SocketEvent::Message { payload } = event.event {
                    let _ = event.connection.send(payload).await;
                }
            }
        });
    }

    pub async fn shutdown(mut self) {
        self.server.stop();
        let _ = self.notify_shutdown.send(());
        self.run_task.abort();
        drop(self.server);
        let _ = timeout(EVENT_TIMEOUT, self.shutdown_complete_rx.recv()).await;
    }
}

pub async fn connect_client(
    addr: SocketAddr,
    config: NetworkConfig,
) -> (Arc<FramedClient>, async_channel::Receiver<SocketEvent>) {
    let endpoint = Endpoint::new("127.0.0.1", addr.port());
    let client = Arc::new(FramedClient::new(endpoint, config));
    let events = client.events();
    client.open().await.unwrap();
    expect_state(&events, ChannelState::Opening).await;
    expect_state(&events, ChannelState::Opened).await;
    (client, events)
}

pub async fn recv_event(events: &async_channel::Receiver<SocketEvent>) -> SocketEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn recv_server_event(events: &async_channel::Receiver<ServerEvent>) -> ServerEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("server event channel closed")
}

pub async fn expect_state(events: &async_channel::Receiver<SocketEvent>, expected: ChannelState) {
    match recv_event(events).await {
        SocketEvent::StateChanged { state, .. } => assert_eq!(state, expected),
        other => panic!("expected state change to {:?}, got {:?}", expected, other),
    }
}

/// Next Full-mode message on a client channel, skipping state changes.
pub async fn next_message(events: &async_channel::Receiver<SocketEvent>) -> Bytes {
    loop {
        match recv_event(events).await {
            SocketEvent::Message { payload } => return payload,
            SocketEvent::StateChanged { .. } | SocketEvent::Accepted => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
}

/// Next Full-mode message on the server channel, skipping lifecycle noise.
pub async fn next_server_message(events: &async_channel::Receiver<ServerEvent>) -> Bytes {
    loop {
        match recv_server_event(events).await.event {
            SocketEvent::Message { payload } => return payload,
            SocketEvent::StateChanged { .. } | SocketEvent::Accepted => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
}

pub fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
