use crate::model::{MetricKey, MetricSample, RegistrationState};
use crate::state::StateStore;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub const MAX_QUEUE: usize = 2000;
const INTAKE_QUEUE_CAP: usize = 100_000;
const BATCH_MAX_SAMPLES: usize = 1000;
const BATCH_MAX_DELAY: Duration = Duration::from_millis(300);
const NOTIFICATION_MAX_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize)]
struct WireSample {
    measurement: String,
    time: f64,
    value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<crate::model::Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check_output: Option<String>,
    id: String,
}

enum OutboundMessage {
    Json { topic: String, payload: Vec<u8>, force: bool },
}

/// Bounded outbound publish queue and sample-intake pipeline over an MQTT
/// session (C8). Mirrors the original agent's bleemeo connector: a
/// store-and-forward channel with last-will, a capped outbound queue, and a
/// separate intake queue for samples awaiting a remote metric id.
pub struct Publisher {
    agent_uuid: String,
    client: AsyncClient,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    intake_tx: mpsc::Sender<MetricSample>,
    queue_depth: Arc<AtomicUsize>,
    connected: Arc<std::sync::atomic::AtomicBool>,
}

pub struct PublisherConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub use_tls: bool,
    pub agent_uuid: String,
    pub password: String,
}

impl Publisher {
    /// Establish the MQTT session: last-will on `disconnect`, QoS 1
    /// throughout, `connect` announced once the event loop confirms
    /// connection (§4.8).
    pub fn connect(config: PublisherConfig, state: Arc<StateStore>) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let client_id = format!("agent-{}", config.agent_uuid);
        let mut opts = MqttOptions::new(client_id, config.mqtt_host, config.mqtt_port);
        opts.set_credentials(format!("{}@bleemeo.com", config.agent_uuid), config.password);
        opts.set_keep_alive(Duration::from_secs(30));

        let will_topic = format!("v1/agent/{}/disconnect", config.agent_uuid);
        opts.set_last_will(LastWill::new(
            &will_topic,
            serde_json::to_vec(&serde_json::json!({"disconnect-cause": "disconnect-will"})).unwrap_or_default(),
            QoS::AtLeastOnce,
            false,
        ));

        if config.use_tls {
            opts.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, MAX_QUEUE);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(MAX_QUEUE);
        let (intake_tx, mut intake_rx) = mpsc::channel::<MetricSample>(INTAKE_QUEUE_CAP);
        let (notification_tx, notification_rx) = mpsc::channel::<Vec<u8>>(64);

        let queue_depth = Arc::new(AtomicUsize::new(0));
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let notify_topic = format!("v1/agent/{}/notification", config.agent_uuid);
        let connect_topic = format!("v1/agent/{}/connect", config.agent_uuid);

        {
            let client = client.clone();
            let connected = connected.clone();
            let notify_topic = notify_topic.clone();
            let connect_topic = connect_topic.clone();
            tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            connected.store(true, Ordering::Relaxed);
                            let _ = client.subscribe(&notify_topic, QoS::AtLeastOnce).await;
                            let payload = serde_json::json!({"public_ip": ""});
                            let _ = client
                                .publish(&connect_topic, QoS::AtLeastOnce, false, payload.to_string())
                                .await;
                            tracing::info!("publisher session connected");
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if publish.payload.len() < NOTIFICATION_MAX_BYTES {
                                let _ = notification_tx.try_send(publish.payload.to_vec());
                            }
                            // larger notifications are silently dropped, matching the
                            // original connector's behavior
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) | Err(_) => {
                            connected.store(false, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
            });
        }

        {
            let client = client.clone();
            let queue_depth = queue_depth.clone();
            tokio::spawn(async move {
                let mut batch: Vec<OutboundMessage> = Vec::new();
                loop {
                    tokio::select! {
                        msg = outbound_rx.recv() => {
                            match msg {
                                Some(msg) => batch.push(msg),
                                None => break,
                            }
                        }
                        _ = tokio::time::sleep(BATCH_MAX_DELAY), if !batch.is_empty() => {}
                    }

                    for msg in batch.drain(..) {
                        let OutboundMessage::Json { topic, payload, .. } = msg;
                        if client.publish(&topic, QoS::AtLeastOnce, false, payload).await.is_ok() {
                            queue_depth.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }

        {
            let outbound_tx = outbound_tx.clone();
            let queue_depth = queue_depth.clone();
            let agent_uuid = config.agent_uuid.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let mut seen_twice = std::collections::HashSet::new();
                let mut batch: Vec<MetricSample> = Vec::new();
                let mut ids: Vec<String> = Vec::new();
                // blocking 3s wait until the first sample arrives, then a tight
                // 300ms poll so a freshly-registered id is picked up promptly
                let mut poll_timeout = Duration::from_secs(3);

                loop {
                    let sample = match tokio::time::timeout(poll_timeout, intake_rx.recv()).await {
                        Ok(Some(s)) => {
                            poll_timeout = Duration::from_millis(300);
                            s
                        }
                        Ok(None) => break,
                        Err(_) => {
                            // queue drained: flush whatever accumulated rather than
                            // stranding it until 1000 samples build up
                            flush_batch(&outbound_tx, &queue_depth, &agent_uuid, &mut batch, &mut ids).await;
                            continue;
                        }
                    };

                    let registry: HashMap<MetricKey, RegistrationState> = state.get_map("metrics_registry");
                    let key = sample.registration_key();
                    match registry.get(&key) {
                        Some(RegistrationState::Deleted) => continue,
                        Some(RegistrationState::Registered(id)) => {
                            seen_twice.remove(&key);
                            batch.push(sample);
                            ids.push(id.clone());
                        }
                        _ => {
                            if !seen_twice.insert(key) {
                                tokio::time::sleep(Duration::from_millis(500)).await;
                                continue;
                            }
                        }
                    }

                    if batch.len() >= BATCH_MAX_SAMPLES {
                        flush_batch(&outbound_tx, &queue_depth, &agent_uuid, &mut batch, &mut ids).await;
                    }
                }

                if !batch.is_empty() {
                    flush_batch(&outbound_tx, &queue_depth, &agent_uuid, &mut batch, &mut ids).await;
                }
            });
        }

        let publisher = Publisher {
            agent_uuid: config.agent_uuid,
            client,
            outbound_tx,
            intake_tx,
            queue_depth,
            connected,
        };

        (publisher, notification_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Enqueue a sample for eventual publication once its remote id is
    /// known. Drops silently when the intake queue is full (§4.8).
    pub fn enqueue_sample(&self, sample: MetricSample) {
        if self.intake_tx.try_send(sample).is_err() {
            tracing::warn!("sample intake queue full; dropping sample");
        }
    }

    async fn publish_raw(&self, topic: String, payload: Vec<u8>, force: bool) {
        if !force && self.queue_depth.load(Ordering::Relaxed) >= MAX_QUEUE {
            tracing::warn!(topic = %topic, "outbound queue full; dropping publish");
            return;
        }
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .outbound_tx
            .send(OutboundMessage::Json { topic, payload, force })
            .await;
    }

    /// Publish a zlib-compressed top_info snapshot.
    pub async fn publish_top_info(&self, snapshot: &serde_json::Value) {
        let topic = format!("v1/agent/{}/top_info", self.agent_uuid);
        let json = serde_json::to_vec(snapshot).unwrap_or_default();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&json).is_err() {
            return;
        }
        let Ok(compressed) = encoder.finish() else { return };
        self.publish_raw(topic, compressed, false).await;
    }

    /// Force-enqueue the clean-shutdown disconnect announcement, bypassing
    /// the queue cap, then drain for up to 5s before the caller disconnects
    /// the session (§4.8, Scenario S6).
    pub async fn publish_clean_disconnect(&self) {
        let topic = format!("v1/agent/{}/disconnect", self.agent_uuid);
        let payload = serde_json::json!({"disconnect-cause": "Clean shutdown"});
        self.publish_raw(topic, serde_json::to_vec(&payload).unwrap_or_default(), true)
            .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

async fn flush_batch(
    outbound_tx: &mpsc::Sender<OutboundMessage>,
    queue_depth: &Arc<AtomicUsize>,
    agent_uuid: &str,
    batch: &mut Vec<MetricSample>,
    ids: &mut Vec<String>,
) {
    if batch.is_empty() {
        return;
    }

    let wire: Vec<WireSample> = batch
        .drain(..)
        .zip(ids.drain(..))
        .map(|(s, id)| WireSample {
            measurement: s.measurement,
            time: s.time,
            value: s.value,
            item: s.item,
            service: s.service,
            container: s.container,
            status: s.status,
            check_output: s.check_output,
            id,
        })
        .collect();

    let topic = format!("v1/agent/{agent_uuid}/data");
    let payload = serde_json::to_vec(&wire).unwrap_or_default();

    if queue_depth.load(Ordering::Relaxed) >= MAX_QUEUE {
        tracing::warn!("outbound queue full; dropping data batch");
        return;
    }
    queue_depth.fetch_add(1, Ordering::Relaxed);
    let _ = outbound_tx
        .send(OutboundMessage::Json { topic, payload, force: false })
        .await;
}

/// Shared lock so health-check logging (§7) can be reasoned about without
/// taking the full Publisher by value.
pub type SharedPublisher = Arc<Mutex<Option<Publisher>>>;
