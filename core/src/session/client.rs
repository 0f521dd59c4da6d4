//! Client Session: registration, address resolution, sends and shutdown
//!
//! One dispatcher task owns the inbound stream. It answers the pending
//! registration, fills the address cache and turns everything else into
//! [`SessionEvent`]s. The foreground only publishes and waits.

use super::address_book::{AddressBook, AddressCacheEntry};
use super::events::SessionEvent;
use super::files::{self, FileError};
use crate::identity::{ClientIdentity, SessionId, Username, UsernameError};
use crate::message::{
    decode_envelope, encode_envelope, CodecError, Envelope, InboxMessage, RegisterOutcome,
    RejectReason, Resolution, ResolveMode,
};
use crate::topic::Topic;
use crate::transport::{Delivery, DeliveryReceiver, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session timing and storage settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a registration result
    pub register_timeout: Duration,
    /// How long `resolve_address` waits for a reply
    pub resolve_timeout: Duration,
    /// Cache re-check interval while resolving
    pub poll_interval: Duration,
    /// Pause after the disconnect notice before closing the link
    pub flush_grace: Duration,
    /// Where incoming files are written
    pub download_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            register_timeout: Duration::from_secs(2),
            resolve_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
            flush_grace: Duration::from_secs(1),
            download_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No address known for {0}; resolve it first")]
    PeerUnreachable(String),
    #[error("Timed out waiting for an address for {0}")]
    TimedOut(String),
    #[error("Invalid username: {0}")]
    InvalidUsername(#[from] UsernameError),
    #[error("Registration aborted: no more username candidates")]
    Aborted,
    #[error("Session is shut down")]
    ShutDown,
    #[error(transparent)]
    File(#[from] FileError),
    #[error("Malformed payload: {0}")]
    Codec(#[from] CodecError),
    #[error("Transport disconnected: {0}")]
    TransportDisconnect(#[from] TransportError),
}

/// Why the previous username candidate did not stick
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterFailure {
    #[error("Registration rejected: {0}")]
    Rejected(RejectReason),
    #[error("No answer from the directory")]
    TimedOut,
    #[error("Invalid username: {0}")]
    Invalid(UsernameError),
}

/// Supplies username candidates to the registration loop
#[async_trait]
pub trait UsernameProvider: Send {
    /// Next name to try; `last` explains why the previous one failed.
    /// `None` gives up.
    async fn next_candidate(&mut self, last: Option<&RegisterFailure>) -> Option<String>;
}

/// Tries a fixed list of names in order
#[derive(Debug, Clone, Default)]
pub struct CandidateList {
    names: VecDeque<String>,
}

impl CandidateList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl UsernameProvider for CandidateList {
    async fn next_candidate(&mut self, _last: Option<&RegisterFailure>) -> Option<String> {
        self.names.pop_front()
    }
}

struct PendingRegistration {
    username: Username,
    session_id: SessionId,
    reply: oneshot::Sender<RegisterOutcome>,
}

/// State shared between the foreground and the dispatcher task
#[derive(Default)]
struct Shared {
    registered: AtomicBool,
    closing: AtomicBool,
    pending: Mutex<Option<PendingRegistration>>,
    /// Attempts that timed out while their result channel stays subscribed.
    /// Lock after `pending` when both are needed.
    abandoned: Mutex<HashMap<Username, SessionId>>,
    book: AddressBook,
}

pub struct ClientSession {
    transport: Arc<dyn Transport>,
    identity: ClientIdentity,
    config: SessionConfig,
    shared: Arc<Shared>,
    cancel: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ClientSession {
    /// Run the registration loop until a username is accepted.
    ///
    /// Each candidate gets its own result channel subscription and
    /// `register_timeout` to be answered. On acceptance the session
    /// subscribes to its inbox, reply, status and file channels.
    pub async fn establish<P>(
        transport: Arc<dyn Transport>,
        inbound: DeliveryReceiver,
        provider: &mut P,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError>
    where
        P: UsernameProvider + ?Sized,
    {
        let session_id = SessionId::generate();
        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(
            inbound,
            Arc::clone(&transport),
            Arc::clone(&shared),
            events_tx,
            config.download_dir.clone(),
        ));

        let registered = register_loop(
            transport.as_ref(),
            &shared,
            provider,
            &session_id,
            config.register_timeout,
        )
        .await;
        let identity = match registered {
            Ok(identity) => identity,
            Err(e) => {
                shared.closing.store(true, Ordering::SeqCst);
                dispatcher.abort();
                return Err(e);
            }
        };

        let username = identity.username.clone();
        let channels = [
            Topic::Inbox(username.clone()),
            Topic::AddressReply(username.clone()),
            Topic::AddressReplyOnly(username.clone()),
            Topic::GetMessage(username.clone()),
            Topic::File(username.clone()),
        ];
        for channel in channels {
            if let Err(e) = transport.subscribe(&channel.to_string()).await {
                warn!("Could not subscribe to {} after registering: {}", channel, e);
                shared.closing.store(true, Ordering::SeqCst);
                dispatcher.abort();
                release_name(transport.as_ref(), &username).await;
                return Err(e.into());
            }
        }
        shared.registered.store(true, Ordering::SeqCst);
        info!("Registered as {} ({})", username, identity.session_id);

        let (cancel, _) = watch::channel(false);
        let session = Self {
            transport,
            identity,
            config,
            shared,
            cancel,
            dispatcher: Mutex::new(Some(dispatcher)),
            shut_down: AtomicBool::new(false),
        };
        Ok((session, events_rx))
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn username(&self) -> &Username {
        &self.identity.username
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    pub fn cached_address(&self, peer: &str) -> Option<String> {
        self.shared.book.get(peer)
    }

    /// Snapshot of the address cache, sorted by name
    pub fn known_peers(&self) -> Vec<(String, AddressCacheEntry)> {
        self.shared.book.snapshot()
    }

    /// Ask the directory for `target`'s inbox and wait for it to land in the
    /// cache.
    ///
    /// Only a reply written after the request counts; an address cached
    /// earlier does not answer it. A NOT_FOUND reply only evicts the cache
    /// entry; the wait carries on until `resolve_timeout`, so callers see
    /// [`SessionError::TimedOut`]. Shutdown ends the wait early with the
    /// same error.
    pub async fn resolve_address(
        &self,
        target: &str,
        mode: ResolveMode,
    ) -> Result<String, SessionError> {
        self.ensure_live()?;
        let target = Username::parse(target.trim())?;

        // Subscribe before publishing so a shutdown racing the request is seen
        let mut cancel = self.cancel.subscribe();
        let since = self.shared.book.generation();
        self.publish(&Envelope::ResolveRequest {
            requester: self.identity.username.clone(),
            target: target.to_string(),
            mode,
        })
        .await?;

        self.shared
            .book
            .wait_for(
                target.as_str(),
                since,
                self.config.resolve_timeout,
                self.config.poll_interval,
                &mut cancel,
            )
            .await
            .ok_or_else(|| SessionError::TimedOut(target.to_string()))
    }

    /// Publish straight to a peer's cached inbox address
    pub async fn send_direct(&self, target: &str, text: &str) -> Result<(), SessionError> {
        self.ensure_live()?;
        let address = self
            .shared
            .book
            .get(target)
            .ok_or_else(|| SessionError::PeerUnreachable(target.to_string()))?;

        self.publish(&Envelope::Inbox {
            address,
            message: InboxMessage::Direct {
                sender: self.identity.username.to_string(),
                text: text.to_string(),
            },
        })
        .await
    }

    /// Ask the directory to deliver `text` to `target`
    pub async fn send_plain(&self, target: &str, text: &str) -> Result<(), SessionError> {
        self.ensure_live()?;
        let target = Username::parse(target.trim())?;
        self.publish(&Envelope::Relay {
            sender: self.identity.username.clone(),
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// Send a file to a peer whose address is cached. Returns the number of
    /// bytes sent.
    pub async fn send_file(&self, target: &str, path: &Path) -> Result<usize, SessionError> {
        self.ensure_live()?;
        let (filename, bytes) = files::read_outgoing(path).await?;
        let recipient = Username::parse(target.trim())?;
        if self.shared.book.get(recipient.as_str()).is_none() {
            return Err(SessionError::PeerUnreachable(recipient.to_string()));
        }

        self.publish(&Envelope::File {
            recipient,
            sender: self.identity.username.to_string(),
            filename,
            encoded: files::encode_file(&bytes),
        })
        .await?;
        Ok(bytes.len())
    }

    /// Tear the session down. Safe to call more than once.
    ///
    /// In-flight waits are cancelled, the directory is told we are leaving,
    /// and the link is closed after one flush grace period.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.closing.store(true, Ordering::SeqCst);
        self.cancel.send_replace(true);

        let mut result = Ok(());
        if self.shared.registered.swap(false, Ordering::SeqCst) {
            let notice = Envelope::Disconnect {
                username: self.identity.username.clone(),
            };
            match self.publish(&notice).await {
                Ok(()) => {
                    if let Err(e) = self.transport.flush().await {
                        debug!("Flush before close failed: {}", e);
                    }
                    tokio::time::sleep(self.config.flush_grace).await;
                }
                Err(e) => {
                    warn!("Could not send disconnect notice: {}", e);
                    result = Err(e);
                }
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!("Close failed: {}", e);
        }
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if tokio::time::timeout(self.config.flush_grace, handle).await.is_err() {
                debug!("Dispatcher did not stop in time");
            }
        }

        info!("Session for {} closed", self.identity.username);
        result
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShutDown);
        }
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let (topic, payload) = encode_envelope(envelope)?;
        self.transport.publish(&topic, payload).await?;
        Ok(())
    }
}

async fn register_loop<P>(
    transport: &dyn Transport,
    shared: &Shared,
    provider: &mut P,
    session_id: &SessionId,
    timeout: Duration,
) -> Result<ClientIdentity, SessionError>
where
    P: UsernameProvider + ?Sized,
{
    let mut last_failure: Option<RegisterFailure> = None;

    loop {
        let candidate = provider
            .next_candidate(last_failure.as_ref())
            .await
            .ok_or(SessionError::Aborted)?;

        let username = match Username::parse(candidate.trim()) {
            Ok(username) => username,
            Err(e) => {
                last_failure = Some(RegisterFailure::Invalid(e));
                continue;
            }
        };

        last_failure = match try_register(transport, shared, &username, session_id, timeout).await? {
            Some(RegisterOutcome::Accepted) => {
                return Ok(ClientIdentity::new(username, session_id.clone()))
            }
            Some(RegisterOutcome::Rejected(reason)) => {
                info!("Registration of {} rejected: {}", username, reason);
                Some(RegisterFailure::Rejected(reason))
            }
            None => {
                warn!("No registration result for {} within {:?}", username, timeout);
                Some(RegisterFailure::TimedOut)
            }
        };
    }
}

/// One registration attempt. `None` means no answer arrived in time.
///
/// A timed-out attempt keeps its result channel; if the directory accepts
/// it later, the dispatcher gives the name back.
async fn try_register(
    transport: &dyn Transport,
    shared: &Shared,
    username: &Username,
    session_id: &SessionId,
    timeout: Duration,
) -> Result<Option<RegisterOutcome>, SessionError> {
    let result_channel = Topic::RegisterResult(username.clone(), session_id.clone()).to_string();
    let (reply_tx, reply_rx) = oneshot::channel();
    {
        let mut pending = shared.pending.lock();
        shared.abandoned.lock().remove(username);
        *pending = Some(PendingRegistration {
            username: username.clone(),
            session_id: session_id.clone(),
            reply: reply_tx,
        });
    }

    transport.subscribe(&result_channel).await?;
    let (topic, payload) = encode_envelope(&Envelope::Register {
        username: username.clone(),
        session_id: session_id.clone(),
    })?;
    transport.publish(&topic, payload).await?;

    let outcome = match tokio::time::timeout(timeout, reply_rx).await {
        Ok(Ok(outcome)) => Some(outcome),
        _ => None,
    };
    let unanswered = {
        let mut pending = shared.pending.lock();
        let unanswered = pending.take().is_some();
        if unanswered {
            shared
                .abandoned
                .lock()
                .insert(username.clone(), session_id.clone());
        }
        unanswered
    };
    if unanswered {
        return Ok(None);
    }
    if let Err(e) = transport.unsubscribe(&result_channel).await {
        debug!("Unsubscribe from {} failed: {}", result_channel, e);
    }
    Ok(outcome)
}

async fn dispatch_loop(
    mut inbound: DeliveryReceiver,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    download_dir: PathBuf,
) {
    while let Some(delivery) = inbound.recv().await {
        if let Some(event) =
            handle_delivery(transport.as_ref(), &shared, &download_dir, delivery).await
        {
            let _ = events.send(event);
        }
    }

    if !shared.closing.load(Ordering::SeqCst) {
        warn!("Lost connection to the broker");
        shared.registered.store(false, Ordering::SeqCst);
        let _ = events.send(SessionEvent::TransportLost);
    }
}

async fn handle_delivery(
    transport: &dyn Transport,
    shared: &Shared,
    download_dir: &Path,
    delivery: Delivery,
) -> Option<SessionEvent> {
    let envelope = match decode_envelope(&delivery.topic, &delivery.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping malformed message on {}: {}", delivery.topic, e);
            return matches!(Topic::parse(&delivery.topic), Ok(Topic::File(_))).then(|| {
                SessionEvent::FileFailed {
                    sender: None,
                    reason: e.to_string(),
                }
            });
        }
    };

    match envelope {
        Envelope::RegisterResult {
            username,
            session_id,
            outcome,
        } => {
            let answered = {
                let mut pending = shared.pending.lock();
                let expected = pending
                    .as_ref()
                    .is_some_and(|p| p.username == username && p.session_id == session_id);
                if expected {
                    pending.take()
                } else {
                    None
                }
            };
            let late = match answered {
                // the attempt can time out between the take and the send
                Some(pending) => pending.reply.send(outcome).err(),
                None => {
                    let mut abandoned = shared.abandoned.lock();
                    if abandoned.get(&username) == Some(&session_id) {
                        abandoned.remove(&username);
                        Some(outcome)
                    } else {
                        debug!("Ignoring stale registration result for {}", username);
                        None
                    }
                }
            };
            if let Some(outcome) = late {
                settle_late_result(transport, &username, &session_id, outcome).await;
            }
            None
        }
        Envelope::ResolveReply {
            name,
            mode,
            resolution,
            ..
        } => {
            match &resolution {
                Resolution::Found(address) => shared.book.insert(&name, address),
                Resolution::NotFound => {
                    if shared.book.evict(&name) {
                        debug!("Evicted stale address for {}", name);
                    }
                }
            }
            Some(SessionEvent::AddressResolved {
                name,
                mode,
                resolution,
            })
        }
        Envelope::Inbox { message, .. } => Some(SessionEvent::Message(message)),
        Envelope::RelayStatus { status, .. } => Some(SessionEvent::RelayStatus(status)),
        Envelope::File {
            sender,
            filename,
            encoded,
            ..
        } => Some(on_file_received(download_dir, sender, filename, &encoded).await),
        other => {
            debug!("Ignoring {} envelope", other.kind());
            None
        }
    }
}

/// A result for an attempt that already gave up. The directory holds an
/// accepted name until told otherwise, so it is released here.
async fn settle_late_result(
    transport: &dyn Transport,
    username: &Username,
    session_id: &SessionId,
    outcome: RegisterOutcome,
) {
    if outcome == RegisterOutcome::Accepted {
        info!("{} was accepted after its attempt timed out; releasing it", username);
        release_name(transport, username).await;
    }
    let channel = Topic::RegisterResult(username.clone(), session_id.clone()).to_string();
    if let Err(e) = transport.unsubscribe(&channel).await {
        debug!("Unsubscribe from {} failed: {}", channel, e);
    }
}

/// Best-effort disconnect notice for a name this client holds
async fn release_name(transport: &dyn Transport, username: &Username) {
    let notice = Envelope::Disconnect {
        username: username.clone(),
    };
    let sent = match encode_envelope(&notice) {
        Ok((topic, payload)) => transport.publish(&topic, payload).await.map_err(SessionError::from),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
        warn!("Could not release {}: {}", username, e);
    }
}

/// Write an incoming file as `received_<filename>`. Failures become an
/// event; the session keeps running.
async fn on_file_received(
    download_dir: &Path,
    sender: String,
    filename: String,
    encoded: &str,
) -> SessionEvent {
    match files::persist_received(download_dir, &filename, encoded).await {
        Ok((saved_to, bytes)) => {
            info!("Received {} ({} bytes) from {}", filename, bytes, sender);
            SessionEvent::FileReceived {
                sender,
                filename,
                saved_to,
                bytes,
            }
        }
        Err(e) => {
            warn!("Could not save {} from {}: {}", filename, sender, e);
            SessionEvent::FileFailed {
                sender: Some(sender),
                reason: e.to_string(),
            }
        }
    }
}
