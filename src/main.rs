use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use relayq::api::{Consumer, Producer};
use relayq::channel::{Channel, ChannelOptions, QueueRef};
use relayq::config::{Settings, load_config};
use relayq::store::QueueStore;
use relayq::transport::{LoopbackConnector, Transport};
use relayq::utils::logging;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(s) => s,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let mode = std::env::args().nth(1).unwrap_or_else(|| "consume".to_string());
    if mode != "produce" && mode != "consume" {
        error!("unknown mode '{mode}', expected 'produce' or 'consume'");
        return ExitCode::from(2);
    }

    let store = match QueueStore::open(&settings.store_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open queue store at {}: {e}", settings.store_path);
            return ExitCode::from(1);
        }
    };

    let transport = match Transport::connect(
        &settings.endpoint,
        Arc::new(LoopbackConnector),
        settings.backoff.clone(),
    )
    .await
    {
        Ok(t) => t,
        Err(e) => {
            error!("unable to reach {}: {e}", settings.endpoint);
            return ExitCode::from(1);
        }
    };

    let channel = match Channel::open_with(
        Arc::clone(&transport),
        store,
        ChannelOptions {
            prefetch: settings.consumer.prefetch,
            delivery_timeout: settings.delivery_timeout(),
        },
    ) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to open channel: {e}");
            transport.close();
            return ExitCode::from(1);
        }
    };

    let queue = match channel.declare_queue(&settings.queue.name, settings.queue.durable) {
        Ok(q) => q,
        Err(e) => {
            error!("failed to declare queue '{}': {e}", settings.queue.name);
            channel.close().await;
            transport.close();
            return ExitCode::from(1);
        }
    };

    let result = match mode.as_str() {
        "produce" => produce(Arc::clone(&channel), queue, &settings).await,
        _ => consume(Arc::clone(&channel), queue).await,
    };

    channel.close().await;
    transport.close();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

/// Reads line-delimited input and sends each non-empty line to the queue.
async fn produce(channel: Arc<Channel>, queue: QueueRef, settings: &Settings) -> relayq::Result<()> {
    let producer = Producer::new(channel, queue, settings.producer.persistent)
        .with_retry(settings.producer.max_retries, settings.backoff.clone());

    info!("type a message and press enter; ctrl-c to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match producer.send(line.as_bytes().to_vec()).await {
                        Ok(id) => info!(id, "sent"),
                        Err(e @ relayq::Error::SendFailed { .. }) => return Err(e),
                        Err(e) => error!("failed to send: {e}"),
                    }
                }
                // stdin closed
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!("stdin error: {e}");
                    return Ok(());
                }
            }
        }
    }
}

/// Subscribes to the queue and logs each payload, acking on completion.
async fn consume(channel: Arc<Channel>, queue: QueueRef) -> relayq::Result<()> {
    let consumer = Consumer::new(channel, queue);
    consumer.subscribe(|message| {
        Box::pin(async move {
            info!("received: {}", message.payload_str());
            // stand-in for real processing work
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
    })?;

    info!("waiting for messages; ctrl-c to quit");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    Ok(())
}
