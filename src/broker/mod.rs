//! Broker session (§4.2): owns the AMQP connection and channel, publishes
//! RPC requests, and consumes the reply queue.
//!
//! lapin's `Channel` is itself clone-and-share-safe, but we still route
//! every outbound operation through a single mailbox task — the same shape
//! as the reconnect-safe shared writer in the PTY broker this module is
//! descended from. A reconnect only has to re-point the mailbox at a fresh
//! channel; callers holding a `BrokerHandle` never notice.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{Duration, sleep};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::constants::RPC_QUEUE;
use crate::correlation::CorrelationRegistry;
use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Init,
    Connecting,
    Ready,
    Disconnected,
    ShuttingDown,
}

type ChannelOp = Box<dyn FnOnce(Channel) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A cheap, cloneable front for the broker session. All publishes flow
/// through the mailbox channel into the task that owns the live `Channel`.
#[derive(Clone)]
pub struct BrokerHandle {
    op_tx: mpsc::Sender<ChannelOp>,
    state: Arc<RwLock<BrokerState>>,
    correlation: Arc<CorrelationRegistry>,
    reply_queue: Arc<Mutex<Option<String>>>,
    dropped_ops: Arc<AtomicU64>,
}

impl BrokerHandle {
    pub async fn state(&self) -> BrokerState {
        *self.state.read().await
    }

    pub fn correlation(&self) -> &CorrelationRegistry {
        &self.correlation
    }

    pub fn dropped_ops(&self) -> u64 {
        self.dropped_ops.load(Ordering::Relaxed)
    }

    /// Publishes an RPC request and registers a correlation waiter for its
    /// reply. Returns `NotConnected` if the reply queue hasn't been
    /// declared yet (the session is still (re)connecting).
    pub async fn publish_request(
        &self,
        queue: &str,
        payload: Bytes,
        deadline: Duration,
    ) -> Result<Bytes, ProxyError> {
        let reply_to = self
            .reply_queue
            .lock()
            .await
            .clone()
            .ok_or(ProxyError::NotConnected)?;
        let correlation_id = Uuid::new_v4();
        let waiter = self.correlation.begin(correlation_id);

        let queue = queue.to_string();
        let props = BasicProperties::default()
            .with_correlation_id(correlation_id.to_string().into())
            .with_reply_to(reply_to.into());

        let op: ChannelOp = Box::new(move |channel| {
            Box::pin(async move {
                let result = channel
                    .basic_publish(
                        "",
                        &queue,
                        BasicPublishOptions::default(),
                        &payload,
                        props,
                    )
                    .await;
                if let Err(err) = result {
                    error!("failed to publish rpc request: {err}");
                }
            })
        });

        if self.op_tx.try_send(op).is_err() {
            self.dropped_ops.fetch_add(1, Ordering::Relaxed);
            self.correlation.forget(&correlation_id);
            return Err(ProxyError::NotConnected);
        }

        self.correlation.wait_for(correlation_id, waiter, deadline).await
    }
}

pub struct BrokerSession {
    config: BrokerConfig,
    handle: BrokerHandle,
    op_rx: Mutex<Option<mpsc::Receiver<ChannelOp>>>,
}

impl BrokerSession {
    pub fn new(config: BrokerConfig) -> (Self, BrokerHandle) {
        let (op_tx, op_rx) = mpsc::channel(1024);
        let handle = BrokerHandle {
            op_tx,
            state: Arc::new(RwLock::new(BrokerState::Init)),
            correlation: Arc::new(CorrelationRegistry::new()),
            reply_queue: Arc::new(Mutex::new(None)),
            dropped_ops: Arc::new(AtomicU64::new(0)),
        };
        (
            Self {
                config,
                handle: handle.clone(),
                op_rx: Mutex::new(Some(op_rx)),
            },
            handle,
        )
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Runs the reconnect loop forever, until `shutdown` resolves. Intended
    /// to be spawned as a single supervised task.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut backoff = Duration::from_millis(500);
        loop {
            if *shutdown.borrow() {
                return;
            }
            *self.handle.state.write().await = BrokerState::Connecting;
            match self.connect_and_serve(&mut shutdown).await {
                Ok(()) => {
                    info!("broker session shut down cleanly");
                    *self.handle.state.write().await = BrokerState::ShuttingDown;
                    return;
                }
                Err(err) => {
                    warn!("broker session lost: {err}, retrying in {backoff:?}");
                    *self.handle.state.write().await = BrokerState::Disconnected;
                    *self.handle.reply_queue.lock().await = None;
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn connect_and_serve(
        &self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let conn = Connection::connect(
            &self.config.amqp_uri(),
            ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current())
                .with_reactor(tokio_reactor_trait::Tokio),
        )
        .await?;
        let channel = conn.create_channel().await?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                RPC_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue_name = reply_queue.name().to_string();
        *self.handle.reply_queue.lock().await = Some(reply_queue_name.clone());

        let mut consumer = channel
            .basic_consume(
                &reply_queue_name,
                "unicornproxy-reply-consumer",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        *self.handle.state.write().await = BrokerState::Ready;
        info!("broker session ready, reply queue {reply_queue_name}");

        let op_rx = {
            let mut guard = self.op_rx.lock().await;
            guard.take()
        };
        let Some(mut op_rx) = op_rx else {
            anyhow::bail!("broker session run() called more than once");
        };

        let result = loop {
            tokio::select! {
                maybe_op = op_rx.recv() => {
                    match maybe_op {
                        Some(op) => op(channel.clone()).await,
                        None => break Ok(()),
                    }
                }
                maybe_delivery = futures_util::StreamExt::next(&mut consumer) => {
                    match maybe_delivery {
                        Some(Ok(delivery)) => {
                            self.handle_reply(&delivery.properties, Bytes::from(delivery.data.clone()));
                            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                                debug!("ack failed (no_ack consumer, informational): {err}");
                            }
                        }
                        Some(Err(err)) => break Err(err.into()),
                        None => break Err(anyhow::anyhow!("reply consumer stream ended")),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        self.op_rx.lock().await.replace(op_rx);
        let _ = channel.close(200, "bye").await;
        let _ = conn.close(200, "bye").await;
        result
    }

    fn handle_reply(&self, properties: &BasicProperties, payload: Bytes) {
        let Some(correlation_id) = properties.correlation_id() else {
            warn!("reply delivery missing correlation_id, dropping");
            return;
        };
        let Ok(id) = Uuid::parse_str(correlation_id.as_str()) else {
            warn!("reply delivery has malformed correlation_id, dropping");
            return;
        };
        self.handle.correlation.resolve(id, payload);
    }
}
