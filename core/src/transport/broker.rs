//! TCP broker: accepts links and routes publishes to matching subscribers

use super::protocol::{read_frame, write_frame, Frame, ProtocolError, PROTOCOL_VERSION};
use super::{topic_matches, validate_filter, validate_topic, TransportError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Broker counters
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub connections_accepted: u64,
    pub active_connections: usize,
    pub handshakes_rejected: u64,
    pub messages_routed: u64,
    pub deliveries: u64,
}

struct ClientEntry {
    client_id: String,
    filters: HashSet<String>,
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    clients: HashMap<u64, ClientEntry>,
}

/// Pub/sub broker over TCP. No retention: a publish reaches whoever is
/// subscribed at that moment.
pub struct TcpBroker {
    listener: TcpListener,
    state: Arc<RwLock<BrokerState>>,
    stats: Arc<RwLock<BrokerStats>>,
}

impl TcpBroker {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            state: Arc::new(RwLock::new(BrokerState::default())),
            stats: Arc::new(RwLock::new(BrokerStats::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> BrokerStats {
        self.stats.read().clone()
    }

    /// Client ids of the links currently attached
    pub fn connected_clients(&self) -> Vec<String> {
        self.state
            .read()
            .clients
            .values()
            .map(|c| c.client_id.clone())
            .collect()
    }

    /// Total filters held across all attached links
    pub fn subscription_count(&self) -> usize {
        self.state.read().clients.values().map(|c| c.filters.len()).sum()
    }

    /// Accept links until `shutdown` flips to true, then say goodbye to
    /// every attached link.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        info!("Broker listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.stats.write().connections_accepted += 1;
                        let state = Arc::clone(&self.state);
                        let stats = Arc::clone(&self.stats);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, state, stats).await {
                                debug!("Connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let mut state = self.state.write();
        for client in state.clients.values() {
            let _ = client.tx.send(Frame::Goodbye);
        }
        state.clients.clear();
        info!("Broker stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RwLock<BrokerState>>,
    stats: Arc<RwLock<BrokerStats>>,
) -> Result<(), ProtocolError> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let client_id = match read_frame(&mut reader).await? {
        Some(Frame::Hello { client_id, version }) if version == PROTOCOL_VERSION => client_id,
        Some(Frame::Hello { version, .. }) => {
            warn!("Rejecting {}: protocol version {}", peer, version);
            stats.write().handshakes_rejected += 1;
            write_frame(&mut writer, &Frame::Goodbye).await?;
            return Ok(());
        }
        Some(other) => {
            warn!("Expected Hello from {}, got {}", peer, other.frame_type());
            stats.write().handshakes_rejected += 1;
            return Ok(());
        }
        None => return Ok(()),
    };
    write_frame(&mut writer, &Frame::HelloAck { version: PROTOCOL_VERSION }).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let id = {
        let mut state = state.write();
        let id = state.next_id;
        state.next_id += 1;
        state.clients.insert(
            id,
            ClientEntry {
                client_id: client_id.clone(),
                filters: HashSet::new(),
                tx,
            },
        );
        id
    };
    stats.write().active_connections += 1;
    info!("Link {} attached from {}", client_id, peer);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let last = matches!(frame, Frame::Goodbye);
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Write to {} failed: {}", peer, e);
                break;
            }
            if last {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Subscribe { filter })) => {
                if validate_filter(&filter).is_err() {
                    warn!("Ignoring invalid filter {:?} from {}", filter, client_id);
                    continue;
                }
                if let Some(client) = state.write().clients.get_mut(&id) {
                    client.filters.insert(filter);
                }
            }
            Ok(Some(Frame::Unsubscribe { filter })) => {
                if let Some(client) = state.write().clients.get_mut(&id) {
                    client.filters.remove(&filter);
                }
            }
            Ok(Some(Frame::Publish { topic, payload })) => {
                route(&state, &stats, &topic, &payload);
            }
            Ok(Some(Frame::Goodbye)) | Ok(None) => break Ok(()),
            Ok(Some(other)) => {
                warn!("Unexpected {} frame from {}", other.frame_type(), client_id);
            }
            Err(e) => break Err(e),
        }
    };

    state.write().clients.remove(&id);
    stats.write().active_connections -= 1;
    let _ = writer_task.await;
    info!("Link {} detached", client_id);
    result
}

fn route(state: &RwLock<BrokerState>, stats: &RwLock<BrokerStats>, topic: &str, payload: &[u8]) {
    if validate_topic(topic).is_err() {
        warn!("Dropping publish to invalid topic {:?}", topic);
        return;
    }

    let mut delivered = 0u64;
    for client in state.read().clients.values() {
        if !client.filters.iter().any(|f| topic_matches(f, topic)) {
            continue;
        }
        let frame = Frame::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        if client.tx.send(frame).is_ok() {
            delivered += 1;
        }
    }

    let mut stats = stats.write();
    stats.messages_routed += 1;
    stats.deliveries += delivered;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_broker() -> (Arc<TcpBroker>, SocketAddr, watch::Sender<bool>) {
        let broker = Arc::new(TcpBroker::bind("127.0.0.1:0").await.unwrap());
        let addr = broker.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = Arc::clone(&broker);
        tokio::spawn(async move { runner.run(stop_rx).await });
        (broker, addr, stop_tx)
    }

    #[tokio::test]
    async fn test_handshake_ack() {
        let (broker, addr, _stop) = spawn_broker().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &Frame::Hello { client_id: "t1".into(), version: PROTOCOL_VERSION })
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut stream).await.unwrap(),
            Some(Frame::HelloAck { version: PROTOCOL_VERSION })
        );
        assert_eq!(broker.stats().connections_accepted, 1);
    }

    #[tokio::test]
    async fn test_wrong_version_gets_goodbye() {
        let (broker, addr, _stop) = spawn_broker().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &Frame::Hello { client_id: "old".into(), version: 0 })
            .await
            .unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), Some(Frame::Goodbye));
        assert_eq!(broker.stats().handshakes_rejected, 1);
        assert!(broker.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn test_routes_between_raw_links() {
        let (broker, addr, _stop) = spawn_broker().await;

        let mut sub = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut sub, &Frame::Hello { client_id: "sub".into(), version: PROTOCOL_VERSION })
            .await
            .unwrap();
        read_frame(&mut sub).await.unwrap();
        write_frame(&mut sub, &Frame::Subscribe { filter: "chat/+/register".into() })
            .await
            .unwrap();

        let mut publisher = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut publisher, &Frame::Hello { client_id: "pub".into(), version: PROTOCOL_VERSION })
            .await
            .unwrap();
        read_frame(&mut publisher).await.unwrap();

        // The subscribe is processed on another task; wait until it lands.
        for _ in 0..100 {
            if broker.subscription_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        write_frame(
            &mut publisher,
            &Frame::Publish { topic: "chat/alice/register".into(), payload: b"s1".to_vec() },
        )
        .await
        .unwrap();

        assert_eq!(
            read_frame(&mut sub).await.unwrap(),
            Some(Frame::Publish { topic: "chat/alice/register".into(), payload: b"s1".to_vec() })
        );
    }

    #[tokio::test]
    async fn test_shutdown_says_goodbye() {
        let (_broker, addr, stop) = spawn_broker().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &Frame::Hello { client_id: "t".into(), version: PROTOCOL_VERSION })
            .await
            .unwrap();
        read_frame(&mut stream).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        stop.send(true).unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), Some(Frame::Goodbye));
    }
}
