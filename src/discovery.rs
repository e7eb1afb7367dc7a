//! Local-network robot discovery.
//!
//! Flow:
//!   1. Bind UDP on the discovery port + 1 and arm the receive loop
//!   2. Broadcast the `irobotmcs` beacon to the discovery port
//!   3. Each JSON reply names the robot (`hostname` = `<model>-<blid>`);
//!      its password is fetched over the TLS probe in a separate task so the
//!      next reply is received without waiting
//!   4. When the timeout elapses the roster is returned in arrival order
//!
//! Only one discovery may run per process; the UDP port is shared.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::credential::{retrieve_credential, RetrieverOptions};
use crate::error::{Result, RoombaError};
use crate::tls::RobotConnector;

pub const DISCOVERY_PORT: u16 = 5678;
pub const BEACON: &str = "irobotmcs";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_BUF_SIZE: usize = 2048;
const RECV_ERROR_DELAY: Duration = Duration::from_millis(100);

static DISCOVERY_LOCK: Mutex<()> = Mutex::const_new(());

// ── Roster types ──────────────────────────────────────────────────────────────

/// Fields of a discovery reply.  Robots send more; the rest is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub hostname:  Option<String>,
    pub robotname: Option<String>,
    pub ip:        Option<String>,
    pub mac:       Option<String>,
    pub sw:        Option<String>,
    pub sku:       Option<String>,
}

impl DiscoveryReply {
    /// Parse a reply payload.  Malformed JSON yields an empty reply so the
    /// host is still listed, just without a name.
    ///
    /// Fields are read one at a time: a non-string `hostname` is kept in its
    /// JSON text form, any other field of the wrong type is dropped alone.
    pub fn parse(payload: &[u8]) -> Self {
        let doc: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!("discovery: unparseable reply ({e})");
                return Self::default();
            }
        };
        let text = |key: &str| doc.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            hostname: match doc.get("hostname") {
                None | Some(Value::Null) => None,
                Some(Value::String(s))   => Some(s.clone()),
                Some(other)              => Some(other.to_string()),
            },
            robotname: text("robotname"),
            ip:        text("ip"),
            mac:       text("mac"),
            sw:        text("sw"),
            sku:       text("sku"),
        }
    }

    /// Short device name: the part of `hostname` after the last `-`.
    pub fn short_name(&self) -> String {
        self.hostname
            .as_deref()
            .and_then(|h| h.rsplit('-').next())
            .unwrap_or_default()
            .to_string()
    }
}

/// One robot that answered a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    host:       IpAddr,
    name:       String,
    credential: String,
    reply:      DiscoveryReply,
}

impl DeviceIdentity {
    pub fn new(host: IpAddr, name: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            host,
            name: name.into(),
            credential: credential.into(),
            reply: DiscoveryReply::default(),
        }
    }

    pub fn host(&self) -> IpAddr { self.host }

    /// Short device name (the robot's BLID); empty when the reply had none.
    pub fn name(&self) -> &str { &self.name }

    /// MQTT password; empty when none could be retrieved.
    pub fn credential(&self) -> &str { &self.credential }

    pub fn reply(&self) -> &DiscoveryReply { &self.reply }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// What happens to credential retrievals still running at the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalledRetrieval {
    /// Abort the retrieval task.
    #[default]
    Cancel,
    /// Leave it running detached; its result is dropped.
    Abandon,
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Port robots listen on for the beacon.
    pub device_port: u16,
    /// Local port replies arrive on (0 = ephemeral).
    pub listen_port: u16,
    /// Total listening time, measured from the beacon send.
    pub timeout:     Duration,
    pub beacon:      String,
    pub retriever:   RetrieverOptions,
    pub stalled:     StalledRetrieval,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            device_port: DISCOVERY_PORT,
            listen_port: DISCOVERY_PORT + 1,
            timeout:     DEFAULT_TIMEOUT,
            beacon:      BEACON.to_string(),
            retriever:   RetrieverOptions::default(),
            stalled:     StalledRetrieval::Cancel,
        }
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// A reply seen by the receive loop whose credential may still be in flight.
struct Pending {
    host:       IpAddr,
    reply:      DiscoveryReply,
    credential: JoinHandle<String>,
}

pub struct Discovery {
    opts:      DiscoveryOptions,
    connector: RobotConnector,
}

impl Discovery {
    pub fn new(opts: DiscoveryOptions) -> Result<Self> {
        Ok(Self { opts, connector: RobotConnector::new()? })
    }

    pub fn options(&self) -> &DiscoveryOptions { &self.opts }

    /// Broadcast to `broadcast` and collect replies until the timeout.
    ///
    /// Waits for any discovery already running in this process.
    pub async fn run(&self, broadcast: IpAddr) -> Result<Vec<DeviceIdentity>> {
        let _guard = DISCOVERY_LOCK.lock().await;
        self.run_locked(broadcast).await
    }

    /// Like [`run`](Self::run) but fails with [`RoombaError::Concurrency`]
    /// instead of waiting when another discovery is in progress.
    pub async fn try_run(&self, broadcast: IpAddr) -> Result<Vec<DeviceIdentity>> {
        let _guard = DISCOVERY_LOCK.try_lock().map_err(|_| RoombaError::Concurrency)?;
        self.run_locked(broadcast).await
    }

    async fn run_locked(&self, broadcast: IpAddr) -> Result<Vec<DeviceIdentity>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.opts.listen_port))
            .await
            .map_err(|e| {
                RoombaError::Connection(format!("bind UDP port {}: {e}", self.opts.listen_port))
            })?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listen(
            Arc::clone(&socket),
            self.opts.beacon.clone(),
            self.connector.clone(),
            self.opts.retriever.clone(),
            tx,
        ));

        let target = (broadcast, self.opts.device_port);
        if let Err(e) = socket.send_to(self.opts.beacon.as_bytes(), target).await {
            listener.abort();
            return Err(RoombaError::Connection(format!(
                "send beacon to {broadcast}:{}: {e}",
                self.opts.device_port
            )));
        }
        info!("discovery: beacon sent to {broadcast}:{}", self.opts.device_port);

        tokio::time::sleep(self.opts.timeout).await;
        listener.abort();

        let mut roster = Vec::new();
        while let Ok(pending) = rx.try_recv() {
            if let Some(identity) = self.settle(pending).await {
                roster.push(identity);
            }
        }
        info!("discovery: {} robot(s) found", roster.len());
        Ok(roster)
    }

    /// Turn a pending reply into an identity if its retrieval has finished.
    async fn settle(&self, pending: Pending) -> Option<DeviceIdentity> {
        let Pending { host, reply, credential } = pending;
        if !credential.is_finished() {
            debug!("discovery: credential retrieval for {host} still running at deadline");
            if self.opts.stalled == StalledRetrieval::Cancel {
                credential.abort();
            }
            return None;
        }
        match credential.await {
            Ok(credential) => Some(DeviceIdentity {
                host,
                name: reply.short_name(),
                credential,
                reply,
            }),
            Err(e) => {
                warn!("discovery: credential task for {host} failed: {e}");
                None
            }
        }
    }
}

/// Where the receive loop reads replies from.
trait Datagrams: Send + Sync + 'static {
    fn recv_datagram(&self, buf: &mut [u8])
        -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl Datagrams for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Receive loop: one iteration per datagram, never waits on retrievals.
async fn listen<S: Datagrams>(
    socket:    Arc<S>,
    beacon:    String,
    connector: RobotConnector,
    retriever: RetrieverOptions,
    tx:        mpsc::UnboundedSender<Pending>,
) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let (n, from) = match socket.recv_datagram(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("discovery: receive failed: {e}");
                tokio::time::sleep(RECV_ERROR_DELAY).await;
                continue;
            }
        };
        let payload = &buf[..n];
        if payload == beacon.as_bytes() {
            continue;
        }
        let host = from.ip();
        let reply = DiscoveryReply::parse(payload);
        debug!("discovery: reply from {host} hostname={:?}", reply.hostname);

        let connector = connector.clone();
        let retriever = retriever.clone();
        let credential = tokio::spawn(async move {
            match retrieve_credential(&connector, host, &retriever).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("discovery: no credential from {host}: {e}");
                    String::new()
                }
            }
        });
        if tx.send(Pending { host, reply, credential }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    async fn closed_port() -> u16 {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    async fn options_for(device: &UdpSocket, timeout_ms: u64) -> DiscoveryOptions {
        DiscoveryOptions {
            device_port: device.local_addr().unwrap().port(),
            listen_port: 0,
            timeout:     Duration::from_millis(timeout_ms),
            retriever:   RetrieverOptions {
                port:    closed_port().await,
                timeout: Some(Duration::from_millis(300)),
            },
            ..DiscoveryOptions::default()
        }
    }

    #[test]
    fn short_name_is_after_last_dash() {
        let reply = DiscoveryReply::parse(br#"{"hostname":"Roomba-3115850251687850","robotname":"Kitchen"}"#);
        assert_eq!(reply.short_name(), "3115850251687850");
        assert_eq!(reply.robotname.as_deref(), Some("Kitchen"));
    }

    #[test]
    fn hostname_without_dash_is_whole_name() {
        let reply = DiscoveryReply::parse(br#"{"hostname":"roomba"}"#);
        assert_eq!(reply.short_name(), "roomba");
    }

    #[test]
    fn malformed_reply_has_empty_name() {
        let reply = DiscoveryReply::parse(b"{not json");
        assert_eq!(reply, DiscoveryReply::default());
        assert_eq!(reply.short_name(), "");
    }

    #[test]
    fn mistyped_extra_field_keeps_hostname() {
        let reply = DiscoveryReply::parse(
            br#"{"hostname":"Roomba-3115850251687850","sw":3,"ip":"192.168.1.20","mac":null}"#,
        );
        assert_eq!(reply.short_name(), "3115850251687850");
        assert_eq!(reply.ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(reply.sw, None);
        assert_eq!(reply.mac, None);
    }

    #[test]
    fn non_string_hostname_is_stringified() {
        let reply = DiscoveryReply::parse(br#"{"hostname":3115850251687850}"#);
        assert_eq!(reply.short_name(), "3115850251687850");
        assert_eq!(DiscoveryReply::parse(br#"{"hostname":null}"#).hostname, None);
    }

    #[tokio::test]
    async fn roster_in_arrival_order_without_echo() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let opts = options_for(&device, 700).await;
        let discovery = Discovery::new(opts).unwrap();

        let robot = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], BEACON.as_bytes());
            device.send_to(BEACON.as_bytes(), from).await.unwrap();
            device
                .send_to(br#"{"hostname":"Roomba-A1111","ip":"127.0.0.1"}"#, from)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            device.send_to(br#"{"hostname":"iRobot-B2222"}"#, from).await.unwrap();
        });

        let roster = discovery.run("127.0.0.1".parse().unwrap()).await.unwrap();
        robot.await.unwrap();

        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].name(), "A1111");
        assert_eq!(roster[1].name(), "B2222");
        assert_eq!(roster[0].reply().ip.as_deref(), Some("127.0.0.1"));
        // Nothing listens on the credential port; the hosts are kept anyway.
        assert!(roster.iter().all(|r| r.credential().is_empty()));
        assert!(roster.iter().all(|r| r.host() == "127.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn malformed_reply_still_listed() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let opts = options_for(&device, 500).await;
        let discovery = Discovery::new(opts).unwrap();

        let robot = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(b"garbage", from).await.unwrap();
        });

        let roster = discovery.run("127.0.0.1".parse().unwrap()).await.unwrap();
        robot.await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name(), "");
    }

    /// A TCP peer that accepts one connection and never answers the TLS
    /// handshake.  The accepted socket is handed back for inspection.
    async fn silent_peer() -> (u16, oneshot::Receiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let _ = tx.send(sock);
        });
        (port, rx)
    }

    /// True when the client end of `sock` is still connected.
    async fn still_open(mut sock: TcpStream) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_millis(200), sock.read(&mut buf)).await {
                Err(_)     => return true,
                Ok(Ok(0))  => return false,
                Ok(Ok(_))  => continue, // ClientHello
                Ok(Err(_)) => return false,
            }
        }
    }

    async fn run_against_silent_peer(stalled: StalledRetrieval) -> (Vec<DeviceIdentity>, TcpStream) {
        let (silent_port, accepted) = silent_peer().await;

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut opts = options_for(&device, 300).await;
        opts.retriever = RetrieverOptions { port: silent_port, timeout: None };
        opts.stalled = stalled;
        let discovery = Discovery::new(opts).unwrap();

        let robot = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(br#"{"hostname":"Roomba-C3333"}"#, from).await.unwrap();
        });

        let roster = discovery.run("127.0.0.1".parse().unwrap()).await.unwrap();
        robot.await.unwrap();
        let sock = tokio::time::timeout(Duration::from_secs(2), accepted)
            .await
            .unwrap()
            .unwrap();
        (roster, sock)
    }

    #[tokio::test]
    async fn stalled_retrieval_is_cancelled_at_deadline() {
        let (roster, sock) = run_against_silent_peer(StalledRetrieval::Cancel).await;
        assert!(roster.is_empty());
        assert!(!still_open(sock).await);
    }

    #[tokio::test]
    async fn abandoned_retrieval_keeps_running_after_deadline() {
        let (roster, sock) = run_against_silent_peer(StalledRetrieval::Abandon).await;
        assert!(roster.is_empty());
        assert!(still_open(sock).await);
    }

    struct FailingSocket {
        calls: AtomicUsize,
    }

    impl Datagrams for FailingSocket {
        async fn recv_datagram(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "socket gone"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receive_errors_back_off() {
        let socket = Arc::new(FailingSocket { calls: AtomicUsize::new(0) });
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(listen(
            Arc::clone(&socket),
            BEACON.to_string(),
            RobotConnector::new().unwrap(),
            RetrieverOptions::default(),
            tx,
        ));
        tokio::time::sleep(Duration::from_millis(350)).await;
        task.abort();
        let calls = socket.calls.load(Ordering::SeqCst);
        assert!((1..=5).contains(&calls), "{calls} receive attempts in 350ms");
    }

    #[tokio::test]
    async fn try_run_surfaces_concurrency() {
        let discovery = Discovery::new(DiscoveryOptions::default()).unwrap();
        let _guard = DISCOVERY_LOCK.lock().await;
        let err = discovery.try_run("127.0.0.1".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, RoombaError::Concurrency));
    }
}
