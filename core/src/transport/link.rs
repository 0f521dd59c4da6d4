//! TCP link: a client connection to a [`TcpBroker`](super::TcpBroker)
//!
//! The socket is owned by two background tasks. Callers talk to the writer
//! through a command channel; the reader turns `Publish` frames into
//! deliveries.

use super::protocol::{read_frame, write_frame, Frame, PROTOCOL_VERSION};
use super::{validate_filter, validate_topic, Delivery, DeliveryReceiver, Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum LinkCommand {
    Send(Frame),
    /// Acknowledged once every earlier frame has been written
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

pub struct TcpLink {
    client_id: String,
    command_tx: mpsc::UnboundedSender<LinkCommand>,
    connected: Arc<AtomicBool>,
}

impl TcpLink {
    /// Connect and complete the Hello/HelloAck handshake
    pub async fn connect(
        addr: &str,
        client_id: &str,
    ) -> Result<(Self, DeliveryReceiver), TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Frame::Hello {
                client_id: client_id.to_string(),
                version: PROTOCOL_VERSION,
            },
        )
        .await?;

        match read_frame(&mut reader).await? {
            Some(Frame::HelloAck { version }) if version == PROTOCOL_VERSION => {}
            Some(Frame::HelloAck { version }) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "Broker speaks protocol version {version}"
                )))
            }
            Some(other) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "Unexpected {} frame during handshake",
                    other.frame_type()
                )))
            }
            None => {
                return Err(TransportError::ConnectionFailed(
                    "Broker closed the connection during handshake".to_string(),
                ))
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(reader, delivery_tx, Arc::clone(&connected)));
        tokio::spawn(write_loop(writer, command_rx, Arc::clone(&connected)));

        info!("Connected to broker at {} as {}", addr, client_id);
        Ok((
            Self {
                client_id: client_id.to_string(),
                command_tx,
                connected,
            },
            delivery_rx,
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, command: LinkCommand) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.command_tx
            .send(command)
            .map_err(|_| TransportError::Closed)
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    deliveries: mpsc::UnboundedSender<Delivery>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Publish { topic, payload })) => {
                if deliveries.send(Delivery { topic, payload }).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Goodbye)) | Ok(None) => {
                debug!("Broker closed the link");
                break;
            }
            Ok(Some(other)) => warn!("Unexpected {} frame from broker", other.frame_type()),
            Err(e) => {
                warn!("Broker link failed: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    connected: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Send(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("Write to broker failed: {}", e);
                    break;
                }
            }
            LinkCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            LinkCommand::Close(ack) => {
                let _ = write_frame(&mut writer, &Frame::Goodbye).await;
                let _ = writer.shutdown().await;
                let _ = ack.send(());
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[async_trait]
impl Transport for TcpLink {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        validate_filter(filter)?;
        self.send(LinkCommand::Send(Frame::Subscribe {
            filter: filter.to_string(),
        }))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.send(LinkCommand::Send(Frame::Unsubscribe {
            filter: filter.to_string(),
        }))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        validate_topic(topic)?;
        self.send(LinkCommand::Send(Frame::Publish {
            topic: topic.to_string(),
            payload,
        }))
    }

    async fn flush(&self) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(LinkCommand::Flush(ack_tx))?;
        ack_rx.await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.command_tx.send(LinkCommand::Close(ack_tx)).is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }
}
