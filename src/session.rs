//! Authenticated MQTT session to one robot.
//!
//! The robot runs its own MQTT broker on port 8883 (TLS 1.2, self-signed).
//! The client id and user name are the robot's BLID, the password is the
//! credential retrieved during discovery.  The robot publishes state reports
//! to the session without any subscription.
//!
//! Flow:
//!   1. `MqttTransport::connect` waits for CONNACK
//!   2. A receive task polls the event loop; every publish is decoded and
//!      handed to the registered observers in arrival order
//!   3. `RoombaClient` encodes commands and publishes them at QoS 0

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration, Transport as MqttWire,
};
use tokio::task::JoinHandle;

use crate::command::{self, Command, Envelope, WeeklySchedule, WifiSecurity};
use crate::error::{Result, RoombaError};
use crate::state::{self, RawMessage};
use crate::tls;

pub const MQTT_PORT: u16 = 8883;

const KEEP_ALIVE:      Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const MAX_PACKET_SIZE: usize = 1024 * 1024;
const EVENT_CAPACITY:  usize = 64;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host:       String,
    pub port:       u16,
    /// Robot BLID; used as client id and user name.
    pub blid:       String,
    pub password:   String,
    pub keep_alive: Duration,
}

impl SessionOptions {
    pub fn new(host: impl Into<String>, blid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host:       host.into(),
            port:       MQTT_PORT,
            blid:       blid.into(),
            password:   password.into(),
            keep_alive: KEEP_ALIVE,
        }
    }
}

// ── Observers ─────────────────────────────────────────────────────────────────

pub type Observer = Arc<dyn Fn(&RawMessage) + Send + Sync>;

/// Handle returned by [`Observers::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

#[derive(Default)]
struct ObserverList {
    next:    u64,
    entries: Vec<(ObserverId, Observer)>,
}

/// Observers notified for every inbound message.
///
/// Notification runs on the session's receive task.  The list is copied
/// before calling out, so an observer may register, unregister or issue
/// commands without deadlocking.  A panicking observer is not contained.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<Mutex<ObserverList>>,
}

impl Observers {
    pub fn new() -> Self { Self::default() }

    pub fn register<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&RawMessage) + Send + Sync + 'static,
    {
        let mut list = self.lock();
        let id = ObserverId(list.next);
        list.next += 1;
        list.entries.push((id, Arc::new(f)));
        id
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut list = self.lock();
        let before = list.entries.len();
        list.entries.retain(|(i, _)| *i != id);
        list.entries.len() != before
    }

    pub fn len(&self) -> usize { self.lock().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn notify(&self, msg: &RawMessage) {
        let snapshot: Vec<Observer> =
            self.lock().entries.iter().map(|(_, o)| Arc::clone(o)).collect();
        for observer in snapshot {
            observer(msg);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ObserverList> {
        // A poisoned list is still structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// The publish/subscribe primitives the session needs from MQTT.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}

/// rumqttc-backed transport.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Connect and wait for the broker's CONNACK, then start the receive task.
    pub async fn connect(
        opts:      &SessionOptions,
        observers: Observers,
    ) -> Result<(Self, JoinHandle<()>)> {
        let mut mqtt = MqttOptions::new(opts.blid.as_str(), opts.host.as_str(), opts.port);
        mqtt.set_keep_alive(opts.keep_alive);
        mqtt.set_credentials(opts.blid.as_str(), opts.password.as_str());
        mqtt.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        mqtt.set_transport(MqttWire::tls_with_config(TlsConfiguration::Rustls(
            tls::build_tls_config()?,
        )));

        let (client, mut event_loop) = AsyncClient::new(mqtt, EVENT_CAPACITY);

        info!("session: connecting to {}:{}", opts.host, opts.port);
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(RoombaError::Connection(format!(
                            "{} refused the session: {:?}",
                            opts.host, ack.code
                        )));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(RoombaError::Connection(format!("{}: {e}", opts.host)));
                }
            }
        }
        info!("session: connected to {}", opts.host);

        let receiver = tokio::spawn(receive_loop(event_loop, observers));
        Ok((Self { client }, receiver))
    }
}

impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, QoS::AtMostOnce, false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

/// Poll the event loop, decoding every publish and notifying observers.
///
/// Ends when the session is disconnected or the client handle is dropped;
/// other errors are retried after a delay (rumqttc reconnects on the next
/// poll).
async fn receive_loop(mut event_loop: EventLoop, observers: Observers) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = state::decode(&publish.topic, &publish.payload);
                debug!("session: {} bytes on {}", publish.payload.len(), msg.topic);
                observers.notify(&msg);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("session: disconnected");
                return;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!("session: client dropped, receive loop done");
                return;
            }
            Err(e) => {
                error!("session: {e}; retrying in {}s", RECONNECT_DELAY.as_secs());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Drives one robot: typed commands out, decoded telemetry in.
pub struct RoombaClient<T: Transport> {
    transport: T,
    observers: Observers,
    receiver:  Option<JoinHandle<()>>,
}

impl RoombaClient<MqttTransport> {
    /// Open an MQTT session to the robot described by `opts`.
    pub async fn connect(opts: &SessionOptions) -> Result<Self> {
        let observers = Observers::new();
        let (transport, receiver) = MqttTransport::connect(opts, observers.clone()).await?;
        Ok(Self { transport, observers, receiver: Some(receiver) })
    }
}

impl<T: Transport> RoombaClient<T> {
    /// Wrap an already-connected transport.  `observers` must be the list
    /// the transport's receive path notifies.
    pub fn with_transport(transport: T, observers: Observers) -> Self {
        Self { transport, observers, receiver: None }
    }

    pub fn observers(&self) -> &Observers { &self.observers }

    /// Register a callback for every inbound message.
    pub fn on_message<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&RawMessage) + Send + Sync + 'static,
    {
        self.observers.register(f)
    }

    pub async fn start(&self)  -> Result<()> { self.execute(Command::Start).await }
    pub async fn stop(&self)   -> Result<()> { self.execute(Command::Stop).await }
    pub async fn pause(&self)  -> Result<()> { self.execute(Command::Pause).await }
    pub async fn resume(&self) -> Result<()> { self.execute(Command::Resume).await }
    pub async fn dock(&self)   -> Result<()> { self.execute(Command::Dock).await }

    /// Send a named action stamped with the current time.
    pub async fn execute(&self, cmd: Command) -> Result<()> {
        self.send(Envelope::action(cmd, command::epoch_secs())?).await
    }

    /// `offset` is local minus UTC in minutes.
    pub async fn set_time(&self, utctime: i64, offset: i32) -> Result<()> {
        self.send(Envelope::set_time(utctime, offset)?).await
    }

    /// Set the robot clock from the local clock.
    pub async fn set_current_time(&self) -> Result<()> {
        self.set_time(command::epoch_secs(), command::local_offset_minutes()).await
    }

    /// Point the robot at a new access point.  Takes effect once START is
    /// pressed on the robot.
    pub async fn set_wifi(&self, ssid: &str, password: &str, sec: WifiSecurity) -> Result<()> {
        self.send(Envelope::set_wifi(ssid, password, sec)?).await
    }

    pub async fn set_schedule(&self, schedule: &WeeklySchedule) -> Result<()> {
        self.send(Envelope::set_schedule(schedule)?).await
    }

    /// Array form of [`set_schedule`](Self::set_schedule); rejects anything
    /// but seven entries per array before touching the network.
    pub async fn set_schedule_arrays(&self, actions: &[bool], hours: &[u8], minutes: &[u8]) -> Result<()> {
        let schedule = WeeklySchedule::from_arrays(actions, hours, minutes)?;
        self.set_schedule(&schedule).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.transport.subscribe(topic).await
    }

    /// Publish an encoded command.  Failures are returned, never retried.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        debug!("session: publish {} {}", envelope.topic, envelope.payload);
        self.transport.publish(envelope.topic, envelope.payload.into_bytes()).await
    }

    /// Close the session and wait for the receive task to finish.
    pub async fn disconnect(mut self) -> Result<()> {
        self.transport.disconnect().await?;
        if let Some(receiver) = self.receiver.take() {
            if let Err(e) = receiver.await {
                warn!("session: receive task ended abnormally: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        fail: bool,
    }

    impl Recorder {
        fn sent(&self) -> Vec<(String, Value)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(t, p)| (t.clone(), serde_json::from_slice(p).unwrap()))
                .collect()
        }
    }

    impl Transport for Recorder {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if self.fail {
                return Err(RoombaError::Connection("broker gone".into()));
            }
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> Result<()> { Ok(()) }

        async fn disconnect(&self) -> Result<()> { Ok(()) }
    }

    #[tokio::test]
    async fn actions_go_to_cmd_topic() {
        let rec = Recorder::default();
        let client = RoombaClient::with_transport(rec.clone(), Observers::new());
        let before = command::epoch_secs();
        client.start().await.unwrap();
        client.dock().await.unwrap();
        let after = command::epoch_secs();
        let sent = rec.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "cmd");
        assert_eq!(sent[0].1["command"], "start");
        let stamped = sent[0].1["time"].as_i64().unwrap();
        assert!(before <= stamped && stamped <= after, "time {stamped} not in {before}..={after}");
        assert_eq!(sent[1].1["command"], "dock");
        assert_eq!(sent[1].1["initiator"], "localApp");
    }

    #[tokio::test]
    async fn deltas_go_to_delta_topic() {
        let rec = Recorder::default();
        let client = RoombaClient::with_transport(rec.clone(), Observers::new());
        client.set_time(1_700_000_000, -300).await.unwrap();
        client.set_wifi("AB", "pw", WifiSecurity::Wpa2).await.unwrap();
        let sent = rec.sent();
        assert!(sent.iter().all(|(t, _)| t == "delta"));
        assert_eq!(sent[0].1["state"]["localtimeoffset"], -300);
        assert_eq!(sent[1].1["state"]["wlcfg"]["ssid"], "4142");
    }

    #[tokio::test]
    async fn bad_schedule_is_rejected_before_publish() {
        let rec = Recorder::default();
        let client = RoombaClient::with_transport(rec.clone(), Observers::new());
        let err = client
            .set_schedule_arrays(&[true; 7], &[9; 7], &[0; 6])
            .await
            .unwrap_err();
        assert!(matches!(err, RoombaError::Argument(_)));
        assert!(rec.sent().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_returned() {
        let rec = Recorder { fail: true, ..Recorder::default() };
        let client = RoombaClient::with_transport(rec, Observers::new());
        assert!(matches!(client.stop().await, Err(RoombaError::Connection(_))));
    }

    #[test]
    fn observers_see_decoded_messages() {
        let observers = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        observers.register(move |m: &RawMessage| {
            let pct = m.snapshot.as_ref().and_then(|s| s.reported()).and_then(|r| r.bat_pct);
            s.lock().unwrap().push(pct);
        });
        observers.notify(&state::decode("t", br#"{"state":{"reported":{"batPct":40}}}"#));
        observers.notify(&state::decode("t", b"garbage"));
        assert_eq!(*seen.lock().unwrap(), vec![Some(40), None]);
    }

    #[test]
    fn observer_can_reenter_the_list() {
        let observers = Observers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = observers.clone();
        let c = Arc::clone(&calls);
        let id = observers.register(move |_m: &RawMessage| {
            c.fetch_add(1, Ordering::SeqCst);
            inner.register(|_m: &RawMessage| {});
        });
        observers.notify(&state::decode("t", b"{}"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(observers.len(), 2);
        assert!(observers.unregister(id));
        assert!(!observers.unregister(id));
    }

    #[test]
    fn session_defaults() {
        let opts = SessionOptions::new("192.168.1.20", "3115850251687850", "secret");
        assert_eq!(opts.port, 8883);
        assert_eq!(opts.keep_alive, Duration::from_secs(30));
    }
}
