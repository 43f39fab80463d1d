//! The routing hub.
//!
//! Every connection gets its own task. A connection first has to identify
//! itself with a text frame; after that every frame is a [`Package`] which
//! the hub readdresses and queues on the destination connections. The hub
//! never looks at payloads.

use crate::config::HubConfig;
use crate::registry::{ConnectedClient, Registry};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use linkhub_core::{HUB_NID, Identification, Message, NULL_DESTINATION, Nid, Package};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// A running hub: configuration plus the registry of identified links.
pub struct Hub {
    config: HubConfig,
    registry: RwLock<Registry>,
    next_session: AtomicU64,
}

impl Hub {
    /// Create a hub with an empty registry. Nothing is bound until [`Hub::run`].
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: RwLock::new(Registry::new()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Listening on ws://{}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let hub = Arc::clone(&self);

            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(stream, addr).await {
                    warn!("Connection error from {}: {:#}", addr, e);
                }
            });
        }
    }

    /// Number of identified connections.
    pub async fn connected(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Nids a package addressed to `destination` would currently reach.
    pub async fn resolve(&self, destination: &str) -> Vec<Nid> {
        self.registry
            .read()
            .await
            .resolve(destination)
            .into_iter()
            .map(|client| client.nid.clone())
            .collect()
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut stream) = ws.split();
        let connected_at = Utc::now();

        info!("{} connected", addr);

        let Some(identification) = self.identify(&mut sink, &mut stream, addr).await? else {
            return Ok(());
        };

        // Register
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let nid = identification.nid.clone();
        let client = ConnectedClient::new(
            identification.nid,
            identification.link_type,
            addr,
            connected_at,
            session,
            outbox_tx,
        );
        let link_type = client.link_type.clone();

        let inserted = self.registry.write().await.insert(client);
        if let Err(e) = inserted {
            warn!("{} rejected: {}", addr, e);
            reject(&mut sink, Message::invalid_package(e.to_string())).await;
            return Ok(());
        }

        info!("{} identified as {} ({})", addr, nid, link_type);

        let ack = Package::from_hub(Message::IdentifySuccessful, nid.as_str());
        let result = match send_package(&mut sink, &ack).await {
            Ok(()) => self.route_loop(&nid, &mut sink, &mut stream, outbox_rx).await,
            Err(e) => Err(e),
        };

        self.registry.write().await.remove(&nid, session);
        info!("{} disconnected", nid);

        result
    }

    /// Run the identification handshake.
    ///
    /// Returns `None` when the connection was rejected or closed before
    /// identifying.
    async fn identify(
        &self,
        sink: &mut WsSink,
        stream: &mut WsSource,
        addr: SocketAddr,
    ) -> anyhow::Result<Option<Identification>> {
        let text = loop {
            let Some(frame) = stream.next().await else {
                debug!("{} left before identifying", addr);
                return Ok(None);
            };
            match frame? {
                WsMessage::Text(text) => break text,
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                WsMessage::Close(_) => {
                    debug!("{} left before identifying", addr);
                    return Ok(None);
                }
                _ => {
                    warn!("{} sent a non-text identification", addr);
                    reject(
                        sink,
                        Message::invalid_package("Invalid identification message (not text)"),
                    )
                    .await;
                    return Ok(None);
                }
            }
        };

        let identification: Identification = match text.parse() {
            Ok(identification) => identification,
            Err(e) => {
                warn!("{} sent an invalid identification: {}", addr, e);
                reject(
                    sink,
                    Message::invalid_package(format!("Invalid identification message ({e})")),
                )
                .await;
                return Ok(None);
            }
        };

        if identification.secret != self.config.secret {
            warn!("{} presented a wrong secret", addr);
            reject(sink, Message::invalid_secret("Invalid secret")).await;
            return Ok(None);
        }

        Ok(Some(identification))
    }

    async fn route_loop(
        &self,
        nid: &Nid,
        sink: &mut WsSink,
        stream: &mut WsSource,
        mut outbox: mpsc::UnboundedReceiver<Package>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                // Incoming package from this link
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!("WebSocket error from {}: {}", nid, e);
                            return Ok(());
                        }
                        None => return Ok(()),
                    };

                    let decoded = match &frame {
                        WsMessage::Binary(bytes) => Package::from_bytes(bytes),
                        WsMessage::Text(text) => Package::from_bytes(text.as_bytes()),
                        WsMessage::Close(_) => return Ok(()),
                        _ => continue,
                    };

                    match decoded {
                        Ok(package) => self.route(nid, package).await,
                        Err(e) => {
                            reject(sink, Message::invalid_package(e.to_string())).await;
                            return Err(anyhow::Error::new(e)
                                .context(format!("{nid} sent an unreadable package")));
                        }
                    }
                }

                // Package routed to this link
                Some(package) = outbox.recv() => {
                    send_package(sink, &package).await?;
                }
            }
        }
    }

    /// Queue a copy of `package` on every destination it resolves to.
    async fn route(&self, sender: &Nid, package: Package) {
        if package.destination == HUB_NID {
            debug!("{} sent {} to the hub, ignoring", sender, package.data.tag());
            return;
        }

        let registry = self.registry.read().await;
        let destinations = registry.resolve(&package.destination);

        debug!(
            "Routing {} from {} to {:?} ({} destinations)",
            package.data.tag(),
            sender,
            package.destination,
            destinations.len()
        );

        for client in destinations {
            let copy = package.forward_to(sender.as_str(), client.nid.as_str());
            if client.send(copy).is_err() {
                debug!("{} is going away, dropping package", client.nid);
            }
        }
    }
}

async fn send_package(sink: &mut WsSink, package: &Package) -> anyhow::Result<()> {
    let bytes = package.to_bytes()?;
    sink.send(WsMessage::Binary(bytes.into())).await?;
    Ok(())
}

/// Send one error package and close. The connection may already be gone.
async fn reject(sink: &mut WsSink, error: Message) {
    let package = Package::from_hub(error, NULL_DESTINATION);
    if let Err(e) = send_package(sink, &package).await {
        debug!("Could not deliver rejection: {:#}", e);
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkhub_core::RequestErrorKind;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::{MaybeTlsStream, connect_async};

    const SECRET: &str = "s3cret";

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> (Arc<Hub>, SocketAddr) {
        let hub = Hub::new(HubConfig::new("127.0.0.1", 0, SECRET));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&hub).serve(listener));
        (hub, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws
    }

    async fn recv(ws: &mut Client) -> Package {
        loop {
            let frame = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for a package")
                .expect("connection closed")
                .unwrap();
            if let WsMessage::Binary(bytes) = frame {
                return Package::from_bytes(&bytes).unwrap();
            }
        }
    }

    async fn assert_silent(ws: &mut Client) {
        let frame = timeout(Duration::from_millis(200), ws.next()).await;
        assert!(frame.is_err(), "unexpected frame: {frame:?}");
    }

    async fn assert_closed(ws: &mut Client) {
        loop {
            match timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("hub should close the connection")
            {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn send(ws: &mut Client, package: &Package) {
        ws.send(WsMessage::Binary(package.to_bytes().unwrap().into()))
            .await
            .unwrap();
    }

    async fn identify(addr: SocketAddr, nid: &str, link_type: &str) -> Client {
        let mut ws = connect(addr).await;
        ws.send(WsMessage::Text(
            format!("Identify {nid}:{link_type}:{SECRET}").into(),
        ))
        .await
        .unwrap();
        let ack = recv(&mut ws).await;
        assert_eq!(ack.data, Message::IdentifySuccessful);
        ws
    }

    async fn wait_for_count(hub: &Hub, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while hub.connected().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached the expected size");
    }

    fn ping(destination: &str, conversation_id: &str) -> Package {
        let mut package = Package::request(
            Message::data("ping", serde_json::json!({"n": 1})),
            "ignored",
            destination,
        );
        package.conversation_id = conversation_id.to_string();
        package
    }

    #[tokio::test]
    async fn identification_registers_and_acknowledges() {
        let (hub, addr) = start().await;
        let mut ws = connect(addr).await;
        ws.send(WsMessage::Text(format!("Identify A1:telegram:{SECRET}").into()))
            .await
            .unwrap();

        let ack = recv(&mut ws).await;
        assert_eq!(ack.data, Message::IdentifySuccessful);
        assert_eq!(ack.source, HUB_NID);
        assert_eq!(ack.destination, "A1");

        assert_eq!(hub.connected().await, 1);
        assert_eq!(hub.resolve("A1").await, vec!["A1".parse::<Nid>().unwrap()]);
        assert_silent(&mut ws).await;
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (hub, addr) = start().await;
        let mut ws = connect(addr).await;
        ws.send(WsMessage::text("Identify A1:telegram:wrong".to_string()))
            .await
            .unwrap();

        let reply = recv(&mut ws).await;
        assert!(matches!(reply.data, Message::InvalidSecret { .. }));
        assert_closed(&mut ws).await;
        assert_eq!(hub.connected().await, 0);
    }

    #[tokio::test]
    async fn malformed_identification_is_rejected() {
        let (hub, addr) = start().await;

        let mut ws = connect(addr).await;
        ws.send(WsMessage::text("Hello there".to_string()))
            .await
            .unwrap();
        assert!(matches!(recv(&mut ws).await.data, Message::InvalidPackage { .. }));
        assert_closed(&mut ws).await;

        let mut ws = connect(addr).await;
        ws.send(WsMessage::Binary(b"Identify A1:telegram:s3cret".to_vec().into()))
            .await
            .unwrap();
        assert!(matches!(recv(&mut ws).await.data, Message::InvalidPackage { .. }));
        assert_closed(&mut ws).await;

        assert_eq!(hub.connected().await, 0);
    }

    #[tokio::test]
    async fn leaving_before_identifying_has_no_effect() {
        let (hub, addr) = start().await;
        let mut ws = connect(addr).await;
        ws.close(None).await.unwrap();
        let _a = identify(addr, "A1", "telegram").await;
        assert_eq!(hub.connected().await, 1);
    }

    #[tokio::test]
    async fn duplicate_nid_is_rejected() {
        let (hub, addr) = start().await;
        let mut first = identify(addr, "A1", "telegram").await;

        let mut second = connect(addr).await;
        second
            .send(WsMessage::Text(format!("Identify A1:discord:{SECRET}").into()))
            .await
            .unwrap();
        assert!(matches!(recv(&mut second).await.data, Message::InvalidPackage { .. }));
        assert_closed(&mut second).await;

        assert_eq!(hub.connected().await, 1);
        let mut b = identify(addr, "B1", "discord").await;
        send(&mut b, &ping("A1", "c1")).await;
        assert_eq!(recv(&mut first).await.source, "B1");
    }

    #[tokio::test]
    async fn routes_to_a_single_nid() {
        let (_hub, addr) = start().await;
        let mut a = identify(addr, "A1", "telegram").await;
        let mut b = identify(addr, "B1", "discord").await;

        let sent = ping("B1", "c1");
        send(&mut a, &sent).await;

        let got = recv(&mut b).await;
        assert_eq!(got.source, "A1");
        assert_eq!(got.destination, "B1");
        assert_eq!(got.conversation_id, "c1");
        assert_eq!(got.data, sent.data);
        assert_silent(&mut a).await;
    }

    #[tokio::test]
    async fn fans_out_to_a_link_type() {
        let (_hub, addr) = start().await;
        let mut t1 = identify(addr, "T1", "telegram").await;
        let mut t2 = identify(addr, "T2", "telegram").await;
        let mut d1 = identify(addr, "D1", "discord").await;

        send(&mut d1, &ping("telegram", "c7")).await;

        for (ws, nid) in [(&mut t1, "T1"), (&mut t2, "T2")] {
            let got = recv(ws).await;
            assert_eq!(got.destination, nid);
            assert_eq!(got.source, "D1");
            assert_eq!(got.conversation_id, "c7");
        }
        assert_silent(&mut t1).await;
        assert_silent(&mut d1).await;
    }

    #[tokio::test]
    async fn null_and_unknown_destinations_are_dropped() {
        let (hub, addr) = start().await;
        let mut a = identify(addr, "A1", "telegram").await;
        let mut b = identify(addr, "B1", "discord").await;

        send(&mut a, &ping(NULL_DESTINATION, "c1")).await;
        send(&mut a, &ping("Z9", "c2")).await;
        send(&mut a, &ping("matrix", "c3")).await;
        send(&mut a, &ping(HUB_NID, "c4")).await;

        assert_silent(&mut a).await;
        assert_silent(&mut b).await;
        assert_eq!(hub.connected().await, 2);
    }

    #[tokio::test]
    async fn disconnect_evicts_the_link() {
        let (hub, addr) = start().await;
        let mut a = identify(addr, "A1", "telegram").await;
        let mut b = identify(addr, "B1", "discord").await;

        b.close(None).await.unwrap();
        wait_for_count(&hub, 1).await;
        assert!(hub.resolve("B1").await.is_empty());
        assert!(hub.resolve("discord").await.is_empty());

        send(&mut a, &ping("B1", "c1")).await;
        assert_silent(&mut a).await;
    }

    #[tokio::test]
    async fn unreadable_package_closes_the_connection() {
        let (hub, addr) = start().await;
        let mut a = identify(addr, "A1", "telegram").await;

        a.send(WsMessage::Binary(b"\x80\x04garbage".to_vec().into()))
            .await
            .unwrap();

        assert!(matches!(recv(&mut a).await.data, Message::InvalidPackage { .. }));
        assert_closed(&mut a).await;
        wait_for_count(&hub, 0).await;
    }

    #[tokio::test]
    async fn preserves_order_per_sender() {
        let (_hub, addr) = start().await;
        let mut a = identify(addr, "A1", "telegram").await;
        let mut b = identify(addr, "B1", "discord").await;

        for i in 0..20 {
            send(&mut a, &ping("B1", &format!("c{i}"))).await;
        }
        for i in 0..20 {
            assert_eq!(recv(&mut b).await.conversation_id, format!("c{i}"));
        }
    }

    #[tokio::test]
    async fn error_payloads_are_routed_untouched() {
        let (_hub, addr) = start().await;
        let mut a = identify(addr, "A1", "telegram").await;
        let mut b = identify(addr, "B1", "discord").await;

        let mut reply = Package::request(
            Message::request_error(RequestErrorKind::HandlerFailed, "boom"),
            "B1",
            "A1",
        );
        reply.conversation_id = "c1".into();
        send(&mut b, &reply).await;

        let got = recv(&mut a).await;
        assert_eq!(got.data, reply.data);
        assert_eq!(got.conversation_id, "c1");
    }
}
