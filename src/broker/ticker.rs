//! Kite ticker WebSocket client for live last-traded prices.
//!
//! The socket runs in its own task. Consumers get a [`TickerHandle`] to
//! subscribe/unsubscribe and a channel of [`StreamEvent`]s. There is no
//! reconnect: once the socket closes the task ends and the handle reports
//! disconnected.

use super::types::Tick;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Events delivered by the ticker task.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Socket is open and accepting subscriptions
    Connected,
    /// Price updates
    Ticks(Vec<Tick>),
    /// Server or client closed the socket
    Closed { code: Option<u16>, reason: String },
    /// Transport failure
    Error(String),
}

/// Commands sent to the ticker task.
#[derive(Debug, Clone, PartialEq)]
pub enum TickerCommand {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    Stop,
}

/// Cheap, cloneable control side of a running ticker.
#[derive(Debug, Clone)]
pub struct TickerHandle {
    commands: mpsc::UnboundedSender<TickerCommand>,
    connected: Arc<AtomicBool>,
}

impl TickerHandle {
    pub fn subscribe(&self, tokens: &[u32]) {
        info!(?tokens, "Subscribing instruments");
        self.send(TickerCommand::Subscribe(tokens.to_vec()));
    }

    pub fn unsubscribe(&self, tokens: &[u32]) {
        info!(?tokens, "Unsubscribing instruments");
        self.send(TickerCommand::Unsubscribe(tokens.to_vec()));
    }

    /// Ask the socket task to close.
    pub fn stop(&self) {
        self.send(TickerCommand::Stop);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, command: TickerCommand) {
        if self.commands.send(command).is_err() {
            warn!("Ticker task has ended; command dropped");
        }
    }

    /// Handle with no socket behind it; commands land on the returned receiver.
    #[cfg(test)]
    pub fn detached(connected: bool) -> (Self, mpsc::UnboundedReceiver<TickerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            commands: tx,
            connected: Arc::new(AtomicBool::new(connected)),
        };
        (handle, rx)
    }
}

/// Kite ticker connection parameters.
pub struct KiteTicker {
    url: String,
}

impl KiteTicker {
    pub fn new(ws_url: &str, api_key: &str, access_token: &str) -> Self {
        let url = format!(
            "{}?api_key={}&access_token={}",
            ws_url.trim_end_matches('/'),
            urlencoding::encode(api_key),
            urlencoding::encode(access_token)
        );
        Self { url }
    }

    /// Spawn the socket task. Readiness is reported through
    /// [`TickerHandle::is_connected`] and a [`StreamEvent::Connected`] event.
    pub fn spawn(self) -> (TickerHandle, mpsc::Receiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let handle = TickerHandle {
            commands: command_tx,
            connected: connected.clone(),
        };

        tokio::spawn(run_socket(self.url, event_tx, command_rx, connected));

        (handle, event_rx)
    }
}

async fn run_socket(
    url: String,
    events: mpsc::Sender<StreamEvent>,
    mut commands: mpsc::UnboundedReceiver<TickerCommand>,
    connected: Arc<AtomicBool>,
) {
    info!("Connecting to ticker WebSocket");

    let ws_stream = match connect_async(&url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!("Ticker connection failed: {}", e);
            let _ = events.send(StreamEvent::Error(e.to_string())).await;
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    connected.store(true, Ordering::SeqCst);
    let _ = events.send(StreamEvent::Connected).await;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let outgoing = match command {
                    Some(TickerCommand::Subscribe(tokens)) => vec![
                        json!({"a": "subscribe", "v": tokens}),
                        json!({"a": "mode", "v": ["ltp", tokens]}),
                    ],
                    Some(TickerCommand::Unsubscribe(tokens)) => {
                        vec![json!({"a": "unsubscribe", "v": tokens})]
                    }
                    Some(TickerCommand::Stop) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                for payload in outgoing {
                    if let Err(e) = write.send(Message::Text(payload.to_string().into())).await {
                        let _ = events.send(StreamEvent::Error(e.to_string())).await;
                        connected.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        let ticks = parse_binary(&data);
                        if !ticks.is_empty() && events.send(StreamEvent::Ticks(ticks)).await.is_err() {
                            warn!("Event receiver dropped");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(message = %text, "Ticker text message");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = events.send(StreamEvent::Closed { code, reason }).await;
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = events.send(StreamEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = events
                            .send(StreamEvent::Closed { code: None, reason: "stream ended".into() })
                            .await;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}

/// Decode a binary ticker frame into last-price ticks.
///
/// Layout: `u16` packet count, then per packet a `u16` length followed by the
/// packet. Every packet mode starts with `i32` token and `i32` last price in
/// the segment's minor unit.
pub fn parse_binary(data: &[u8]) -> Vec<Tick> {
    // Single-byte frames are heartbeats
    if data.len() < 2 {
        return Vec::new();
    }

    let count = u16::from_be_bytes([data[0], data[1]]) as usize;
    let mut offset = 2;
    let mut ticks = Vec::with_capacity(count);

    for _ in 0..count {
        if offset + 2 > data.len() {
            break;
        }
        let len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;
        if offset + len > data.len() {
            break;
        }
        let packet = &data[offset..offset + len];
        offset += len;

        if packet.len() < 8 {
            continue;
        }
        let token = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let raw = i32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

        // Currency derivatives quote to 7 places, BSE currency to 4, all else paise
        let scale = match token & 0xff {
            3 => 7,
            6 => 4,
            _ => 2,
        };

        ticks.push(Tick {
            instrument_token: token,
            last_price: Decimal::new(raw as i64, scale),
        });
    }

    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn packet(token: u32, paise: i32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&8u16.to_be_bytes());
        p.extend_from_slice(&token.to_be_bytes());
        p.extend_from_slice(&paise.to_be_bytes());
        p
    }

    #[test]
    fn test_parse_ltp_packets() {
        let mut frame = 2u16.to_be_bytes().to_vec();
        frame.extend(packet(12_345_609, 4_712_345));
        frame.extend(packet(9_876_521, 31_250));

        let ticks = parse_binary(&frame);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].instrument_token, 12_345_609);
        assert_eq!(ticks[0].last_price, dec!(47123.45));
        assert_eq!(ticks[1].last_price, dec!(312.50));
    }

    #[test]
    fn test_heartbeat_and_truncated_frames() {
        assert!(parse_binary(&[0]).is_empty());

        let mut frame = 2u16.to_be_bytes().to_vec();
        frame.extend(packet(12_345_609, 100));
        frame.extend_from_slice(&[0, 8, 1, 2]); // second packet cut short
        let ticks = parse_binary(&frame);
        assert_eq!(ticks.len(), 1);
    }

    #[test]
    fn test_ticker_url_carries_credentials() {
        let ticker = KiteTicker::new("wss://ws.kite.trade/", "key", "tok/en");
        assert_eq!(ticker.url, "wss://ws.kite.trade?api_key=key&access_token=tok%2Fen");
    }

    #[tokio::test]
    async fn test_detached_handle_forwards_commands() {
        let (handle, mut rx) = TickerHandle::detached(true);
        handle.subscribe(&[1, 2]);
        handle.stop();
        assert_eq!(rx.recv().await, Some(TickerCommand::Subscribe(vec![1, 2])));
        assert_eq!(rx.recv().await, Some(TickerCommand::Stop));
        assert!(handle.is_connected());
    }
}
