//! Worker executor (§4.6): a single-threaded consumer of `rpc_queue` that
//! performs the outbound request and replies with either the real response
//! or a synthetic error envelope.

pub mod outbound;

use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{error, info, warn};
use scopeguard::guard;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::codec::WireEnvelope;
use crate::config::Config;
use crate::constants::{MAX_MESSAGE_SIZE, RPC_QUEUE};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};

use outbound::{OutboundError, synthetic_response};

/// Runs the consume loop until `shutdown` flips to `true`. Returns on a
/// clean shutdown or propagates a broker I/O error (the supervisor decides
/// whether to restart this task — it is not self-healing).
pub async fn run(
    config: &Config,
    worker_id: u32,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let conn = Connection::connect(
        &config.broker.amqp_uri(),
        ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio),
    )
    .await?;
    let channel = conn.create_channel().await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;
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

    let consumer_tag = format!("unicornproxy-worker-{worker_id}");
    let mut consumer = channel
        .basic_consume(
            RPC_QUEUE,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!("worker {worker_id} ready, consuming {RPC_QUEUE}");

    loop {
        tokio::select! {
            maybe_delivery = futures_util::StreamExt::next(&mut consumer) => {
                match maybe_delivery {
                    Some(Ok(delivery)) => {
                        handle_delivery(&channel, delivery, config.outbound_timeout).await;
                    }
                    Some(Err(err)) => {
                        error!("worker {worker_id} consumer error: {err}");
                        return Err(err.into());
                    }
                    None => {
                        warn!("worker {worker_id} consumer stream ended");
                        return Ok(());
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("worker {worker_id} shutting down");
                    let _ = channel.close(200, "bye").await;
                    let _ = conn.close(200, "bye").await;
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_delivery(channel: &Channel, delivery: Delivery, outbound_timeout: Duration) {
    let acker = delivery.acker.clone();
    // Ack unconditionally once processing finishes, from a scope guard so
    // an early return below can never skip it (§4.6 step 8).
    let _ack_guard = guard((), move |_| {
        let acker = acker.clone();
        tokio::spawn(async move {
            if let Err(err) = acker.ack(lapin::options::BasicAckOptions::default()).await {
                error!("failed to ack delivery: {err}");
            }
        });
    });

    let reply_to = match delivery.properties.reply_to() {
        Some(reply_to) => reply_to.to_string(),
        None => {
            warn!("delivery missing reply_to, dropping");
            return;
        }
    };
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();

    let response = process(&delivery.data, outbound_timeout).await;
    let payload = match response.to_wire_form() {
        Ok(text) => text.into_bytes(),
        Err(err) => {
            error!("failed to encode response envelope: {err}");
            return;
        }
    };

    let props = BasicProperties::default().with_correlation_id(correlation_id.into());
    if let Err(err) = channel
        .basic_publish("", &reply_to, BasicPublishOptions::default(), &payload, props)
        .await
    {
        error!("failed to publish reply: {err}");
    }
}

async fn process(payload: &[u8], outbound_timeout: Duration) -> ResponseEnvelope {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(err) => return synthetic_response(502, "Bad Gateway", err.to_string()),
    };

    let request = match RequestEnvelope::from_wire_form(text) {
        Ok(request) => request,
        Err(_) => {
            return synthetic_response(502, "Bad Gateway", "Couldn't decode a JSON object…");
        }
    };

    let response = match outbound::execute(&request, outbound_timeout).await {
        Ok(response) => response,
        Err(err) => {
            return match err {
                OutboundError::Connect(msg) | OutboundError::Tls(msg) | OutboundError::Io(msg) => {
                    synthetic_response(504, "Gateway Timeout", msg)
                }
                OutboundError::Parse(msg) => synthetic_response(502, "Bad Gateway", msg),
            };
        }
    };

    match response.to_wire_form() {
        Ok(text) if text.len() <= MAX_MESSAGE_SIZE => response,
        Ok(_) => synthetic_response(502, "Bad Gateway", "Message response too large."),
        Err(err) => synthetic_response(502, "Bad Gateway", err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_payload_yields_502() {
        let response = process(b"not json", Duration::from_secs(1)).await;
        assert_eq!(response.status_code, 502);
        assert_eq!(response.content.to_string_lossy(), "Couldn't decode a JSON object…");
    }
}
