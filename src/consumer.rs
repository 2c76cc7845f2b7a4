use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::NatsSettings;
use crate::metrics;
use crate::model::TradeSignal;
use crate::outcome::AckAction;
use crate::pipeline::SignalPipeline;

/// Ensure the JetStream stream + durable pull consumer exist, then spawn the
/// consume loop. Returns the handle to the consumer task.
pub async fn start_signal_consumer(
    client: async_nats::Client,
    settings: NatsSettings,
    pipeline: Arc<SignalPipeline>,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error + Send + Sync>> {
    let jetstream = async_nats::jetstream::new(client.clone());

    let stream = match jetstream.get_stream(&settings.stream).await {
        Ok(s) => s,
        Err(_) => {
            info!("creating JetStream stream: {}", settings.stream);
            jetstream
                .create_stream(async_nats::jetstream::stream::Config {
                    name: settings.stream.clone(),
                    subjects: vec![settings.subject.clone()],
                    storage: async_nats::jetstream::stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    error!("failed to create JetStream stream: {}", e);
                    e
                })?
        }
    };

    let consumer = stream
        .create_consumer(async_nats::jetstream::consumer::pull::Config {
            durable_name: Some(settings.durable.clone()),
            filter_subject: settings.subject.clone(),
            ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
            ack_wait: Duration::from_secs(settings.ack_wait_secs),
            max_deliver: settings.max_deliver,
            ..Default::default()
        })
        .await
        .map_err(|e| {
            error!("failed to create JetStream consumer: {}", e);
            e
        })?;

    info!(
        "JetStream consumer '{}' listening on '{}' (ack_wait={}s, max_deliver={})",
        settings.durable, settings.subject, settings.ack_wait_secs, settings.max_deliver
    );

    let mut messages = consumer.messages().await.map_err(|e| {
        error!("failed to get messages stream: {}", e);
        e
    })?;

    let dlq_subject = settings.dlq_subject.clone().filter(|s| !s.is_empty());

    let handle = tokio::spawn(async move {
        while let Some(msg_result) = messages.next().await {
            let msg = match msg_result {
                Ok(msg) => msg,
                Err(e) => {
                    error!("error receiving message from JetStream: {}", e);
                    continue;
                }
            };

            match serde_json::from_slice::<TradeSignal>(&msg.payload) {
                Ok(signal) => {
                    let result = pipeline.process(signal);
                    info!(
                        status = ?result.status,
                        ack = ?result.ack_action,
                        signal_id = ?result.signal_id,
                        "signal processed"
                    );
                    apply_ack(&msg, result.ack_action).await;
                }
                Err(e) => {
                    // Poison message: publish to DLQ and TERM so the stream
                    // never loops on it.
                    error!("failed to decode signal payload: {}", e);
                    metrics::inc_invalid_payloads();
                    if let Some(dlq) = &dlq_subject {
                        publish_dlq(&client, dlq, &msg.payload, &e.to_string()).await;
                    }
                    if let Err(e) = msg
                        .ack_with(async_nats::jetstream::AckKind::Term)
                        .await
                    {
                        error!("failed to TERM poison message: {}", e);
                    }
                }
            }
        }
        warn!("JetStream message stream closed");
    });

    Ok(handle)
}

async fn apply_ack(msg: &async_nats::jetstream::Message, action: AckAction) {
    match action {
        AckAction::Ack => {
            if let Err(e) = msg.ack().await {
                error!("failed to ACK message: {}", e);
            }
        }
        AckAction::NoAck => {
            // Intentionally nothing: ack-wait expiry drives redelivery.
            warn!("leaving message un-acked, will redeliver after ack-wait");
        }
        AckAction::Nak => {
            if let Err(e) = msg
                .ack_with(async_nats::jetstream::AckKind::Nak(None))
                .await
            {
                error!("failed to NAK message: {}", e);
            }
        }
        AckAction::Term => {
            if let Err(e) = msg.ack_with(async_nats::jetstream::AckKind::Term).await {
                error!("failed to TERM message: {}", e);
            }
        }
    }
}

async fn publish_dlq(client: &async_nats::Client, subject: &str, original: &[u8], error: &str) {
    let payload = serde_json::json!({
        "error": error,
        "original": String::from_utf8_lossy(original),
    });
    match serde_json::to_vec(&payload) {
        Ok(bytes) => {
            if let Err(e) = client.publish(subject.to_string(), bytes.into()).await {
                error!("DLQ publish failed: {}", e);
            } else {
                metrics::inc_dlq_published();
            }
        }
        Err(e) => error!("DLQ payload build failed: {}", e),
    }
}
