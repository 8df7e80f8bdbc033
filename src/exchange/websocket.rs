//! Public WebSocket stream for real-time tickers.

use crate::error::{BotError, Result};
use crate::exchange::types::{Ticker, TickerEvent};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

pub const PUBLIC_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
pub const PUBLIC_TESTNET_WS_URL: &str = "wss://wspap.okx.com:8443/ws/v5/public";

#[derive(Debug, Deserialize)]
struct PushMessage {
    #[allow(dead_code)]
    arg: ChannelArg,
    data: Vec<Ticker>,
}

#[derive(Debug, Deserialize)]
struct ChannelArg {
    #[allow(dead_code)]
    channel: String,
}

/// Connect, subscribe to the `tickers` channel for each instrument, and
/// forward parsed ticks until the connection drops.
///
/// The receiver yields `Connected` first and `Disconnected` last; callers
/// resubscribe to restart the stream.
pub async fn subscribe_tickers(
    url: &str,
    inst_ids: &[String],
) -> Result<mpsc::Receiver<TickerEvent>> {
    info!(%url, instruments = inst_ids.len(), "connecting ticker stream");

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| BotError::Stream(format!("websocket connect failed: {e}")))?;

    let (mut write, mut read) = ws_stream.split();

    let args: Vec<_> = inst_ids
        .iter()
        .map(|id| json!({ "channel": "tickers", "instId": id }))
        .collect();
    let subscribe = json!({ "op": "subscribe", "args": args });
    write
        .send(Message::Text(subscribe.to_string().into()))
        .await
        .map_err(|e| BotError::Stream(format!("subscribe send failed: {e}")))?;

    let (tx, rx) = mpsc::channel(256);
    let _ = tx.send(TickerEvent::Connected).await;

    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    for event in parse_push(&text) {
                        if tx.send(event).await.is_err() {
                            warn!("ticker receiver dropped");
                            return;
                        }
                    }
                }
                Ok(Message::Ping(_)) => {
                    debug!("received ping");
                    // Pong is handled automatically by tungstenite
                }
                Ok(Message::Close(_)) => {
                    info!("ticker stream closed by server");
                    let _ = tx.send(TickerEvent::Disconnected).await;
                    return;
                }
                Err(e) => {
                    error!("ticker stream error: {}", e);
                    let _ = tx.send(TickerEvent::Disconnected).await;
                    return;
                }
                _ => {}
            }
        }
        let _ = tx.send(TickerEvent::Disconnected).await;
    });

    Ok(rx)
}

/// Parse one push frame into ticker events. Subscription acks and
/// unrelated channels produce nothing.
fn parse_push(text: &str) -> Vec<TickerEvent> {
    match serde_json::from_str::<PushMessage>(text) {
        Ok(push) => push.data.into_iter().map(TickerEvent::Ticker).collect(),
        Err(_) => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_push_extracts_tickers() {
        let frame = r#"{
            "arg": {"channel": "tickers", "instId": "BTC-USDT-SWAP"},
            "data": [{
                "instId": "BTC-USDT-SWAP",
                "last": "50000.5",
                "bidPx": "50000.4",
                "bidSz": "20",
                "askPx": "50000.6",
                "askSz": "15",
                "ts": "1700000000000"
            }]
        }"#;
        let events = parse_push(frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TickerEvent::Ticker(t) => {
                assert_eq!(t.inst_id, "BTC-USDT-SWAP");
                assert_eq!(t.bid_price, dec!(50000.4));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_push_ignores_subscription_ack() {
        let ack = r#"{"event": "subscribe", "arg": {"channel": "tickers", "instId": "BTC-USDT"}}"#;
        assert!(parse_push(ack).is_empty());
    }
}
