use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use keel_common::error::CommonError;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// The stable address of a message-passing peer: a logical id plus the
/// host and port its transport listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn anonymous(host: impl Into<String>, port: u16) -> Self {
        Self::new("", host, port)
    }

    pub fn authority(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.id, self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, rest) = match s.split_once('@') {
            Some((id, rest)) => (id, rest),
            None => ("", s),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| CommonError::InvalidArgument(format!("invalid endpoint: {s}")))?;
        if host.is_empty() {
            return Err(CommonError::InvalidArgument(format!(
                "invalid endpoint: {s}"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CommonError::InvalidArgument(format!("invalid endpoint port: {s}")))?;
        Ok(Self::new(id, host, port))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Encoding of a message type onto the wire.
/// Decoding must reject truncated or unrecognized frames with
/// [WireError::Malformed] rather than produce partial values.
pub trait Wire: Sized + Send + 'static {
    fn encode(&self) -> Result<Bytes, WireError>;
    fn decode(bytes: &[u8]) -> Result<Self, WireError>;
}

/// Every frame carries the sender's stable endpoint so that the receiver
/// can address replies without a connection back-channel.
#[derive(Serialize, Deserialize)]
struct Frame {
    from: Endpoint,
    payload: Vec<u8>,
}

fn encode_frame<M: Wire>(from: &Endpoint, message: &M) -> Result<Bytes, WireError> {
    let frame = Frame {
        from: from.clone(),
        payload: message.encode()?.to_vec(),
    };
    bincode::serialize(&frame)
        .map(Bytes::from)
        .map_err(|e| WireError::Malformed(e.to_string()))
}

fn decode_frame<M: Wire>(bytes: &[u8]) -> Result<(Endpoint, M), WireError> {
    let frame: Frame =
        bincode::deserialize(bytes).map_err(|e| WireError::Malformed(e.to_string()))?;
    let message = M::decode(&frame.payload)?;
    Ok((frame.from, message))
}

#[derive(Debug)]
pub enum TransportEvent<M> {
    Delivered { from: Endpoint, message: M },
    /// A linked peer has become unreachable.
    /// Emitted once per active link; linking again re-arms the notification.
    PeerClosed { peer: Endpoint },
}

/// The sending half of a transport.
///
/// Sends are non-blocking and best-effort: a message to an unreachable peer
/// is dropped silently, and the failure surfaces only through link-death
/// notifications on endpoints registered with [Transport::link].
pub trait Transport<M: Wire>: Send + Sync {
    fn local(&self) -> &Endpoint;
    fn send(&self, peer: &Endpoint, message: M);
    fn link(&self, peer: &Endpoint);
    /// The number of inbound frames dropped because they failed to decode.
    fn malformed_frames(&self) -> u64;
}

/// The receiving half of a transport.
pub struct TransportMailbox<M> {
    receiver: mpsc::UnboundedReceiver<TransportEvent<M>>,
}

impl<M> TransportMailbox<M> {
    pub async fn recv(&mut self) -> Option<TransportEvent<M>> {
        self.receiver.recv().await
    }
}

type PeerKey = (String, u16);
type PeerMap = HashMap<PeerKey, mpsc::UnboundedSender<Bytes>>;
type LinkSet = HashSet<Endpoint>;

/// TCP transport with length-delimited frames.
///
/// Outbound connections are cached per peer authority and torn down on
/// failure; inbound connections are accepted by a background listener task.
/// All background tasks exit when the transport is dropped.
pub struct TcpTransport<M: Wire> {
    local: Endpoint,
    events: mpsc::UnboundedSender<TransportEvent<M>>,
    peers: Arc<Mutex<PeerMap>>,
    links: Arc<Mutex<LinkSet>>,
    malformed: Arc<AtomicU64>,
    // Dropping the sender tells every background task to wind down.
    _shutdown: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

impl<M: Wire> TcpTransport<M> {
    pub async fn bind(
        id: impl Into<String>,
        host: &str,
        port: u16,
    ) -> std::io::Result<(Self, TransportMailbox<M>)> {
        let listener = TcpListener::bind((host, port)).await?;
        let port = listener.local_addr()?.port();
        let local = Endpoint::new(id, host, port);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let malformed = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_listener::<M>(
            listener,
            events_tx.clone(),
            Arc::clone(&malformed),
            shutdown_rx.clone(),
        ));
        let transport = Self {
            local,
            events: events_tx,
            peers: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashSet::new())),
            malformed,
            _shutdown: shutdown_tx,
            shutdown: shutdown_rx,
        };
        let mailbox = TransportMailbox {
            receiver: events_rx,
        };
        Ok((transport, mailbox))
    }

    fn peer_sender(&self, peer: &Endpoint) -> mpsc::UnboundedSender<Bytes> {
        let key = peer.authority();
        let mut peers = self.peers.lock();
        if let Some(sender) = peers.get(&key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(key.clone(), tx.clone());
        tokio::spawn(run_connection::<M>(
            key,
            rx,
            Arc::clone(&self.peers),
            Arc::clone(&self.links),
            self.events.clone(),
            self.shutdown.clone(),
        ));
        tx
    }
}

impl<M: Wire> Transport<M> for TcpTransport<M> {
    fn local(&self) -> &Endpoint {
        &self.local
    }

    fn send(&self, peer: &Endpoint, message: M) {
        let frame = match encode_frame(&self.local, &message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode message to {peer}: {e}");
                return;
            }
        };
        if self.peer_sender(peer).send(frame).is_err() {
            debug!("dropping message to {peer}: connection is gone");
        }
    }

    fn link(&self, peer: &Endpoint) {
        self.links.lock().insert(peer.clone());
        // Make sure a connection exists so that the death of an otherwise
        // idle peer is observable.
        let _ = self.peer_sender(peer);
    }

    fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

async fn run_listener<M: Wire>(
    listener: TcpListener,
    events: mpsc::UnboundedSender<TransportEvent<M>>,
    malformed: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(run_reader::<M>(
                        stream,
                        events.clone(),
                        Arc::clone(&malformed),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                }
            },
        }
    }
}

async fn run_reader<M: Wire>(
    stream: TcpStream,
    events: mpsc::UnboundedSender<TransportEvent<M>>,
    malformed: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => match decode_frame::<M>(&bytes) {
                    Ok((from, message)) => {
                        if events
                            .send(TransportEvent::Delivered { from, message })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        malformed.fetch_add(1, Ordering::Relaxed);
                        warn!("dropping inbound frame: {e}");
                    }
                },
                Some(Err(e)) => {
                    debug!("inbound connection failed: {e}");
                    break;
                }
                None => break,
            },
        }
    }
}

async fn run_connection<M: Wire>(
    key: PeerKey,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    peers: Arc<Mutex<PeerMap>>,
    links: Arc<Mutex<LinkSet>>,
    events: mpsc::UnboundedSender<TransportEvent<M>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let stream = match TcpStream::connect((key.0.as_str(), key.1)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("failed to connect to {}:{}: {e}", key.0, key.1);
            fail_peer(&peers, &links, &events, &key);
            return;
        }
    };
    let (read_half, write_half) = stream.into_split();
    let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    // The read half is only watched for the peer going away; peers answer
    // over their own outbound connections.
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Flush whatever was queued before the transport went away.
                while let Ok(bytes) = frames.try_recv() {
                    if writer.send(bytes).await.is_err() {
                        break;
                    }
                }
                return;
            }
            frame = frames.recv() => match frame {
                Some(bytes) => {
                    if writer.send(bytes).await.is_err() {
                        fail_peer(&peers, &links, &events, &key);
                        return;
                    }
                }
                None => return,
            },
            inbound = reader.next() => match inbound {
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    fail_peer(&peers, &links, &events, &key);
                    return;
                }
            },
        }
    }
}

fn fail_peer<M: Wire>(
    peers: &Mutex<PeerMap>,
    links: &Mutex<LinkSet>,
    events: &mpsc::UnboundedSender<TransportEvent<M>>,
    key: &PeerKey,
) {
    peers.lock().remove(key);
    let dead = {
        let mut links = links.lock();
        let dead = links
            .iter()
            .filter(|peer| peer.host == key.0 && peer.port == key.1)
            .cloned()
            .collect::<Vec<_>>();
        for peer in &dead {
            links.remove(peer);
        }
        dead
    };
    for peer in dead {
        let _ = events.send(TransportEvent::PeerClosed { peer });
    }
}

struct NetworkInner<M> {
    endpoints: HashMap<Endpoint, mpsc::UnboundedSender<TransportEvent<M>>>,
    /// Watched endpoint to the set of endpoints holding a link to it.
    links: HashMap<Endpoint, HashSet<Endpoint>>,
}

/// An in-process channel mesh with the same semantics as the TCP transport,
/// for deterministic tests.
pub struct InMemoryNetwork<M> {
    inner: Arc<Mutex<NetworkInner<M>>>,
}

impl<M> Clone for InMemoryNetwork<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Wire> Default for InMemoryNetwork<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Wire> InMemoryNetwork<M> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    pub fn register(&self, local: Endpoint) -> (InMemoryTransport<M>, TransportMailbox<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().endpoints.insert(local.clone(), tx);
        let transport = InMemoryTransport {
            local,
            network: self.clone(),
        };
        let mailbox = TransportMailbox { receiver: rx };
        (transport, mailbox)
    }

    /// Remove an endpoint from the mesh, notifying everyone linked to it.
    pub fn deregister(&self, endpoint: &Endpoint) {
        let watchers = {
            let mut inner = self.inner.lock();
            inner.endpoints.remove(endpoint);
            inner.links.remove(endpoint).unwrap_or_default()
        };
        for watcher in watchers {
            self.notify_closed(&watcher, endpoint.clone());
        }
    }

    fn notify_closed(&self, watcher: &Endpoint, peer: Endpoint) {
        let sender = self.inner.lock().endpoints.get(watcher).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::PeerClosed { peer });
        }
    }
}

pub struct InMemoryTransport<M: Wire> {
    local: Endpoint,
    network: InMemoryNetwork<M>,
}

impl<M: Wire> Clone for InMemoryTransport<M> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            network: self.network.clone(),
        }
    }
}

impl<M: Wire> Transport<M> for InMemoryTransport<M> {
    fn local(&self) -> &Endpoint {
        &self.local
    }

    fn send(&self, peer: &Endpoint, message: M) {
        let sender = self.network.inner.lock().endpoints.get(peer).cloned();
        match sender {
            Some(sender) => {
                let _ = sender.send(TransportEvent::Delivered {
                    from: self.local.clone(),
                    message,
                });
            }
            None => {
                debug!("dropping message to unknown peer {peer}");
                self.fail_link(peer);
            }
        }
    }

    fn link(&self, peer: &Endpoint) {
        let reachable = {
            let mut inner = self.network.inner.lock();
            if inner.endpoints.contains_key(peer) {
                inner
                    .links
                    .entry(peer.clone())
                    .or_default()
                    .insert(self.local.clone());
                true
            } else {
                false
            }
        };
        if !reachable {
            self.network.notify_closed(&self.local, peer.clone());
        }
    }

    fn malformed_frames(&self) -> u64 {
        0
    }
}

impl<M: Wire> InMemoryTransport<M> {
    fn fail_link(&self, peer: &Endpoint) {
        let armed = {
            let mut inner = self.network.inner.lock();
            inner
                .links
                .get_mut(peer)
                .is_some_and(|watchers| watchers.remove(&self.local))
        };
        if armed {
            self.network.notify_closed(&self.local, peer.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum TestMessage {
        Ping { seq: u64 },
        Ack { seq: u64 },
    }

    impl Wire for TestMessage {
        fn encode(&self) -> Result<Bytes, WireError> {
            bincode::serialize(self)
                .map(Bytes::from)
                .map_err(|e| WireError::Malformed(e.to_string()))
        }

        fn decode(bytes: &[u8]) -> Result<Self, WireError> {
            bincode::deserialize(bytes).map_err(|e| WireError::Malformed(e.to_string()))
        }
    }

    #[test]
    fn test_endpoint_display_and_parse() {
        let endpoint = Endpoint::new("scheduler", "127.0.0.1", 5050);
        assert_eq!(endpoint.to_string(), "scheduler@127.0.0.1:5050");
        assert_eq!("scheduler@127.0.0.1:5050".parse::<Endpoint>().unwrap(), endpoint);

        let anonymous = Endpoint::anonymous("10.0.0.1", 5050);
        assert_eq!(anonymous.to_string(), "10.0.0.1:5050");
        assert_eq!("10.0.0.1:5050".parse::<Endpoint>().unwrap(), anonymous);

        assert!("10.0.0.1".parse::<Endpoint>().is_err());
        assert!("10.0.0.1:notaport".parse::<Endpoint>().is_err());
        assert!(":5050".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_tcp_send_and_receive() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (a, _a_mailbox) = TcpTransport::<TestMessage>::bind("a", "127.0.0.1", 0)
            .await
            .unwrap();
        let (b, mut b_mailbox) = TcpTransport::<TestMessage>::bind("b", "127.0.0.1", 0)
            .await
            .unwrap();

        a.send(b.local(), TestMessage::Ping { seq: 7 });
        match b_mailbox.recv().await.unwrap() {
            TransportEvent::Delivered { from, message } => {
                assert_eq!(from, *a.local());
                assert_eq!(message, TestMessage::Ping { seq: 7 });
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_link_death_on_peer_shutdown() {
        let (a, mut a_mailbox) = TcpTransport::<TestMessage>::bind("a", "127.0.0.1", 0)
            .await
            .unwrap();
        let (b, mut b_mailbox) = TcpTransport::<TestMessage>::bind("b", "127.0.0.1", 0)
            .await
            .unwrap();
        let b_endpoint = b.local().clone();

        a.link(&b_endpoint);
        a.send(&b_endpoint, TestMessage::Ping { seq: 1 });
        assert!(matches!(
            b_mailbox.recv().await.unwrap(),
            TransportEvent::Delivered { .. }
        ));

        drop(b);
        drop(b_mailbox);
        match a_mailbox.recv().await.unwrap() {
            TransportEvent::PeerClosed { peer } => assert_eq!(peer, b_endpoint),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_link_death_on_unreachable_peer() {
        let (a, mut a_mailbox) = TcpTransport::<TestMessage>::bind("a", "127.0.0.1", 0)
            .await
            .unwrap();
        // Grab a port with no listener behind it.
        let unreachable = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            Endpoint::new("ghost", "127.0.0.1", listener.local_addr().unwrap().port())
        };

        a.link(&unreachable);
        match a_mailbox.recv().await.unwrap() {
            TransportEvent::PeerClosed { peer } => assert_eq!(peer, unreachable),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_malformed_frame_is_counted_and_dropped() {
        let (a, mut a_mailbox) = TcpTransport::<TestMessage>::bind("a", "127.0.0.1", 0)
            .await
            .unwrap();
        let mut stream = TcpStream::connect((a.local().host.as_str(), a.local().port))
            .await
            .unwrap();
        // A length-delimited frame whose payload is not a valid envelope.
        stream.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        // A valid message afterwards still gets through.
        let (b, _b_mailbox) = TcpTransport::<TestMessage>::bind("b", "127.0.0.1", 0)
            .await
            .unwrap();
        b.send(a.local(), TestMessage::Ack { seq: 2 });
        match a_mailbox.recv().await.unwrap() {
            TransportEvent::Delivered { message, .. } => {
                assert_eq!(message, TestMessage::Ack { seq: 2 });
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The garbage connection is processed independently of the valid one.
        for _ in 0..100 {
            if a.malformed_frames() == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("malformed frame was never counted");
    }

    #[tokio::test]
    async fn test_in_memory_send_and_link_death() {
        let network = InMemoryNetwork::<TestMessage>::new();
        let a_endpoint = Endpoint::new("a", "local", 1);
        let b_endpoint = Endpoint::new("b", "local", 2);
        let (a, mut a_mailbox) = network.register(a_endpoint.clone());
        let (b, mut b_mailbox) = network.register(b_endpoint.clone());

        a.send(&b_endpoint, TestMessage::Ping { seq: 3 });
        match b_mailbox.recv().await.unwrap() {
            TransportEvent::Delivered { from, message } => {
                assert_eq!(from, a_endpoint);
                assert_eq!(message, TestMessage::Ping { seq: 3 });
            }
            other => panic!("unexpected event: {other:?}"),
        }

        b.send(&a_endpoint, TestMessage::Ack { seq: 3 });
        assert!(matches!(
            a_mailbox.recv().await.unwrap(),
            TransportEvent::Delivered { .. }
        ));

        a.link(&b_endpoint);
        network.deregister(&b_endpoint);
        match a_mailbox.recv().await.unwrap() {
            TransportEvent::PeerClosed { peer } => assert_eq!(peer, b_endpoint),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_memory_send_to_unknown_peer_is_silent() {
        let network = InMemoryNetwork::<TestMessage>::new();
        let a_endpoint = Endpoint::new("a", "local", 1);
        let ghost = Endpoint::new("ghost", "local", 9);
        let (a, mut a_mailbox) = network.register(a_endpoint);

        // Not linked: nothing is delivered and nothing blows up.
        a.send(&ghost, TestMessage::Ping { seq: 1 });

        // Linked: the failed send surfaces as link death, exactly once.
        a.link(&ghost);
        match a_mailbox.recv().await.unwrap() {
            TransportEvent::PeerClosed { peer } => assert_eq!(peer, ghost),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
