//! A link's connection to the hub.
//!
//! [`Link::connect`] identifies with the hub and spawns a task that owns the
//! socket. Incoming packages either answer one of our pending requests or
//! are handed to [`Handlers`]; everything outgoing goes through a
//! [`LinkHandle`].

use crate::handlers::Handlers;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use linkhub_core::{
    CodecError, Identification, KeyedLock, LinkType, Message, Nid, Package, RequestErrorKind,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// How to reach the hub and who to be once there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:44444`.
    pub url: String,
    #[serde(default = "Nid::generate")]
    pub nid: Nid,
    pub link_type: LinkType,
    pub secret: String,
    /// How long [`LinkHandle::request`] waits for a reply.
    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub request_timeout: Duration,
    /// Run handlers for packages from one source one at a time. Off by
    /// default: a handler that calls back into its requester while this is
    /// on waits for the requester's own handlers to finish.
    #[serde(default)]
    pub serialize_per_source: bool,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl LinkConfig {
    /// Config with a freshly generated nid.
    pub fn new(url: impl Into<String>, link_type: LinkType, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            nid: Nid::generate(),
            link_type,
            secret: secret.into(),
            request_timeout: default_request_timeout(),
            serialize_per_source: false,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(dur.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Errors seen by a link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("hub refused our secret: {0}")]
    InvalidSecret(String),
    #[error("hub rejected identification: {0}")]
    Rejected(String),
    #[error("link is closed")]
    Closed,
    #[error("no reply after {0:?}")]
    Timeout(Duration),
    #[error("request failed ({kind:?}): {description}")]
    Request {
        kind: RequestErrorKind,
        description: String,
    },
}

enum Outgoing {
    Package(Package),
    Close,
}

/// A request waiting for its reply.
struct Waiter {
    reply: oneshot::Sender<Package>,
    /// Our own request already came back to us once.
    echoed: bool,
}

/// Requests waiting for a reply, by conversation id.
#[derive(Clone, Default)]
struct Pending(Arc<Mutex<HashMap<String, Waiter>>>);

impl Pending {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a pending entry when the request finishes or is dropped.
struct Waiting<'a> {
    pending: &'a Pending,
    conversation_id: String,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.conversation_id);
    }
}

/// Entry point for connecting a link.
pub struct Link;

impl Link {
    /// Connect to the hub, identify, and start serving `handlers`.
    pub async fn connect(config: LinkConfig, handlers: Handlers) -> Result<LinkHandle, LinkError> {
        let (ws, _) = connect_async(config.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let identification = Identification::new(
            config.nid.clone(),
            config.link_type.clone(),
            config.secret.clone(),
        );
        sink.send(WsMessage::text(identification.to_string())).await?;

        let ack = next_package(&mut stream).await?.ok_or(LinkError::Closed)?;
        match ack.data {
            Message::IdentifySuccessful => {}
            Message::InvalidSecret { reason } => return Err(LinkError::InvalidSecret(reason)),
            Message::InvalidPackage { reason } => return Err(LinkError::Rejected(reason)),
            other => {
                return Err(LinkError::Rejected(format!(
                    "expected an identification ack, got {}",
                    other.tag()
                )));
            }
        }

        info!("Identified as {} ({})", config.nid, config.link_type);

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let pending = Pending::default();
        let inbound = Inbound {
            nid: config.nid.clone(),
            handlers: Arc::new(handlers),
            locks: config.serialize_per_source.then(KeyedLock::new),
            pending: pending.clone(),
            outbox: outbox_tx.clone(),
        };

        let nid = config.nid.clone();
        let task_pending = pending.clone();
        tokio::spawn(async move {
            match run(sink, stream, outbox_rx, inbound).await {
                Ok(()) => info!("Link {} closed", nid),
                Err(e) => warn!("Link {} failed: {}", nid, e),
            }
            // Wake every waiting request.
            task_pending.lock().clear();
        });

        Ok(LinkHandle {
            nid: config.nid,
            link_type: config.link_type,
            outbox: outbox_tx,
            pending,
            request_timeout: config.request_timeout,
        })
    }
}

/// Read frames until a package arrives. `None` means the hub hung up.
async fn next_package(stream: &mut WsSource) -> Result<Option<Package>, LinkError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            WsMessage::Binary(bytes) => return Ok(Some(Package::from_bytes(&bytes)?)),
            WsMessage::Text(text) => return Ok(Some(Package::from_bytes(text.as_bytes())?)),
            WsMessage::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

async fn run(
    mut sink: WsSink,
    mut stream: WsSource,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    inbound: Inbound,
) -> Result<(), LinkError> {
    loop {
        tokio::select! {
            package = next_package(&mut stream) => {
                match package? {
                    Some(package) => inbound.receive(package),
                    None => return Ok(()),
                }
            }

            outgoing = outbox.recv() => {
                match outgoing {
                    Some(Outgoing::Package(package)) => {
                        sink.send(WsMessage::Binary(package.to_bytes()?.into())).await?;
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Routes incoming packages to waiting requests or to handlers.
struct Inbound {
    nid: Nid,
    handlers: Arc<Handlers>,
    /// When set, handlers for packages from the same source never run
    /// concurrently.
    locks: Option<KeyedLock<String>>,
    pending: Pending,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl Inbound {
    fn receive(&self, package: Package) {
        if let Some(waiter) = self.take_waiter(&package) {
            debug!("Reply {} from {}", package.conversation_id, package.source);
            let _ = waiter.reply.send(package);
            return;
        }

        let handlers = Arc::clone(&self.handlers);
        let locks = self.locks.clone();
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            let _guard = match &locks {
                Some(locks) => Some(locks.acquire(package.source.clone()).await),
                None => None,
            };
            if let Some(reply) = handlers.dispatch(package).await {
                let _ = outbox.send(Outgoing::Package(reply));
            }
        });
    }

    /// The waiter `package` answers, if any.
    ///
    /// A request addressed to ourselves (directly or through our own link
    /// type) arrives first as the request itself, which goes to the
    /// handlers. Only what comes after it is the reply.
    fn take_waiter(&self, package: &Package) -> Option<Waiter> {
        let mut pending = self.pending.lock();
        let is_reply = match pending.get_mut(&package.conversation_id) {
            Some(waiter) if package.source == self.nid.as_str() && !waiter.echoed => {
                waiter.echoed = true;
                false
            }
            Some(_) => true,
            None => false,
        };
        if is_reply {
            pending.remove(&package.conversation_id)
        } else {
            None
        }
    }
}

/// Cheap, cloneable handle for talking through a connected link.
#[derive(Clone)]
pub struct LinkHandle {
    nid: Nid,
    link_type: LinkType,
    outbox: mpsc::UnboundedSender<Outgoing>,
    pending: Pending,
    request_timeout: Duration,
}

impl LinkHandle {
    /// The nid this link identified with.
    pub fn nid(&self) -> &Nid {
        &self.nid
    }

    /// The link type this link identified with.
    pub fn link_type(&self) -> &LinkType {
        &self.link_type
    }

    /// Queue a package for the hub.
    pub fn send(&self, package: Package) -> Result<(), LinkError> {
        self.outbox
            .send(Outgoing::Package(package))
            .map_err(|_| LinkError::Closed)
    }

    /// Send `message` to `destination` without waiting for a reply.
    /// Returns the conversation id.
    pub fn send_to(&self, destination: &str, message: Message) -> Result<String, LinkError> {
        let package = Package::request(message, self.nid.as_str(), destination);
        let conversation_id = package.conversation_id.clone();
        self.send(package)?;
        Ok(conversation_id)
    }

    /// Send `message` to `destination` and wait for the correlated reply.
    ///
    /// A `RequestError` reply becomes [`LinkError::Request`]. If nothing
    /// answers within the configured timeout the request fails with
    /// [`LinkError::Timeout`]; the hub gives no other signal that a
    /// destination was unreachable.
    pub async fn request(&self, destination: &str, message: Message) -> Result<Message, LinkError> {
        let package = Package::request(message, self.nid.as_str(), destination);
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            reply: tx,
            echoed: false,
        };
        self.pending
            .lock()
            .insert(package.conversation_id.clone(), waiter);
        let _waiting = Waiting {
            pending: &self.pending,
            conversation_id: package.conversation_id.clone(),
        };

        self.send(package)?;

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(LinkError::Closed),
            Err(_) => return Err(LinkError::Timeout(self.request_timeout)),
        };

        match reply.data {
            Message::RequestError { kind, description } => {
                Err(LinkError::Request { kind, description })
            }
            data => Ok(data),
        }
    }

    /// Ask the link task to close the connection.
    pub fn close(&self) {
        let _ = self.outbox.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// Wait until the connection has ended.
    pub async fn closed(&self) {
        self.outbox.closed().await
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("nid", &self.nid)
            .field("link_type", &self.link_type)
            .finish_non_exhaustive()
    }
}
