//! Market-data ingestion task: WebSocket connect/reconnect with exponential
//! backoff, stall detection, and forwarding of parsed frames into the bot
//! loop over an `mpsc` channel (§4.1.1).
//!
//! Grounded on the teacher's `ingestor::connect_and_listen` reconnect loop
//! and `StallPanicFlag`/stall-watcher task, generalized away from
//! Hyperliquid's wire format: frame parsing is delegated to a `FrameParser`
//! implemented by the venue adapter, so this module owns only the
//! connection lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::market_data::{L2Book, Trade};

pub const STALL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub enum MarketDataEvent {
    Book(L2Book),
    Trade(Trade),
}

/// Parses one raw WS text frame into a `MarketDataEvent`, venue-specific.
pub trait FrameParser: Send + Sync {
    fn parse(&self, text: &str) -> Option<MarketDataEvent>;
}

/// Shared flag the execution engine watches to trigger cancel_all on
/// network stall; cleared by the controller after reconciliation.
pub type StallPanicFlag = Arc<AtomicBool>;

pub fn new_stall_flag() -> StallPanicFlag {
    Arc::new(AtomicBool::new(false))
}

/// Exponential backoff with a cap, grounded on the teacher's
/// `retry_delay_secs`/`max_delay_secs` reconnect loop.
pub fn next_backoff(current_secs: u64, max_secs: u64) -> u64 {
    (current_secs * 2).min(max_secs)
}

pub struct IngestionConfig {
    pub ws_url: String,
    pub subscriptions: Vec<String>,
    pub max_backoff_secs: u64,
}

/// Runs the reconnect loop until the task is dropped. Emits parsed frames on
/// `tx`; flips `stall_panic` if no message arrives within `STALL_TIMEOUT_SECS`.
pub async fn run(
    config: IngestionConfig,
    parser: Arc<dyn FrameParser>,
    tx: mpsc::Sender<MarketDataEvent>,
    stall_panic: StallPanicFlag,
) {
    let mut backoff_secs = 1u64;

    loop {
        log::info!("ingestion: connecting to {}", config.ws_url);
        match connect_async(&config.ws_url).await {
            Ok((ws_stream, _)) => {
                log::info!("ingestion: connected");
                backoff_secs = 1;
                stall_panic.store(false, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                for sub in &config.subscriptions {
                    if let Err(e) = write.send(Message::Text(sub.clone())).await {
                        log::error!("ingestion: subscribe failed: {}", e);
                    }
                }

                let last_message = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));
                let watcher_last_message = last_message.clone();
                let watcher_stall = stall_panic.clone();
                let watcher = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        let elapsed = watcher_last_message.lock().unwrap().elapsed();
                        let stalled = elapsed >= Duration::from_secs(STALL_TIMEOUT_SECS);
                        if stalled && !watcher_stall.load(Ordering::SeqCst) {
                            log::error!("ingestion: network stall detected, no message for {:?}", elapsed);
                            watcher_stall.store(true, Ordering::SeqCst);
                        }
                    }
                });

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            *last_message.lock().unwrap() = tokio::time::Instant::now();
                            if let Some(event) = parser.parse(&text) {
                                if tx.send(event).await.is_err() {
                                    watcher.abort();
                                    return;
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            *last_message.lock().unwrap() = tokio::time::Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => {
                            log::warn!("ingestion: server closed connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("ingestion: read error: {}", e);
                            break;
                        }
                    }
                }
                watcher.abort();
            }
            Err(e) => {
                log::error!("ingestion: connect failed: {}", e);
            }
        }

        log::warn!("ingestion: reconnecting in {}s", backoff_secs);
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = next_backoff(backoff_secs, config.max_backoff_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(1, 32), 2);
        assert_eq!(next_backoff(16, 32), 32);
        assert_eq!(next_backoff(32, 32), 32);
    }

    #[test]
    fn stall_flag_starts_clear() {
        let flag = new_stall_flag();
        assert!(!flag.load(Ordering::SeqCst));
    }
}
