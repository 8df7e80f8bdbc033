//! OKX v5 REST API client.

use crate::config::ExchangeConfig;
use crate::error::{BotError, Result};
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::*;
use crate::exchange::websocket;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

const REST_BASE_URL: &str = "https://www.okx.com";

/// Standard v5 response envelope. `code != "0"` is a venue rejection.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: String,
    msg: String,
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RawOrderAck {
    #[serde(rename = "ordId")]
    order_id: String,
    #[serde(rename = "sCode")]
    s_code: String,
    #[serde(rename = "sMsg")]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderDetail {
    #[serde(rename = "ordId")]
    order_id: String,
    state: OrderState,
    #[serde(rename = "accFillSz", deserialize_with = "de_decimal_or_zero")]
    filled_size: Decimal,
    #[serde(rename = "avgPx", deserialize_with = "de_decimal_or_zero")]
    avg_price: Decimal,
    #[serde(deserialize_with = "de_decimal_or_zero")]
    fee: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawLeverage {
    #[serde(deserialize_with = "de_decimal_or_zero")]
    lever: Decimal,
    #[serde(rename = "mgnMode")]
    margin_mode: String,
}

#[derive(Debug, Deserialize)]
struct RawTradeFee {
    #[serde(deserialize_with = "de_decimal_or_zero")]
    taker: Decimal,
    #[serde(deserialize_with = "de_decimal_or_zero")]
    maker: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    details: Vec<RawBalanceDetail>,
}

#[derive(Debug, Deserialize)]
struct RawBalanceDetail {
    ccy: String,
    #[serde(deserialize_with = "de_decimal_or_zero")]
    eq: Decimal,
    #[serde(rename = "availBal", deserialize_with = "de_decimal_or_zero")]
    avail: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    #[serde(rename = "pos", deserialize_with = "de_decimal_or_zero")]
    contracts: Decimal,
    #[serde(rename = "avgPx", deserialize_with = "de_decimal_or_zero")]
    avg_price: Decimal,
    #[serde(rename = "liqPx", deserialize_with = "de_decimal_or_zero")]
    liquidation_price: Decimal,
    #[serde(deserialize_with = "de_decimal_or_zero")]
    margin: Decimal,
    #[serde(rename = "upl", deserialize_with = "de_decimal_or_zero")]
    unrealized_pnl: Decimal,
    #[serde(deserialize_with = "de_decimal_or_zero")]
    lever: Decimal,
    #[serde(deserialize_with = "de_decimal_or_zero")]
    last: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawBill {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "type")]
    bill_type: String,
    #[serde(deserialize_with = "de_decimal_or_zero")]
    pnl: Decimal,
    #[serde(deserialize_with = "de_millis_str")]
    ts: i64,
}

/// OKX client for both the spot and swap legs of one account.
pub struct OkxClient {
    http: Client,
    api_key: String,
    secret_key: String,
    passphrase: String,
    testnet: bool,
    base_url: String,
    ws_url: String,
}

impl OkxClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BotError::exchange("http", format!("failed to build client: {e}")))?;

        let ws_url = if config.testnet {
            websocket::PUBLIC_TESTNET_WS_URL.to_string()
        } else {
            websocket::PUBLIC_WS_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            passphrase: config.passphrase.clone(),
            testnet: config.testnet,
            base_url: REST_BASE_URL.to_string(),
            ws_url,
        })
    }

    /// Sign `timestamp + method + path + body` with HMAC-SHA256, base64.
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| BotError::exchange("sign", e.to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<Vec<T>> {
        let url = format!("{}{}", self.base_url, path);
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();

        let mut request = self.http.request(method.clone(), &url);
        if signed {
            let timestamp = Self::timestamp();
            let signature = self.sign(&timestamp, method.as_str(), path, &body_str)?;
            request = request
                .header("OK-ACCESS-KEY", &self.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
            if self.testnet {
                request = request.header("x-simulated-trading", "1");
            }
        }
        if body.is_some() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_str);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BotError::exchange("http", format!("{method} {path} failed: {e}")))?;

        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| BotError::exchange("http", format!("{method} {path} bad response: {e}")))?;

        if envelope.code != "0" {
            return Err(BotError::Exchange {
                code: envelope.code,
                message: envelope.msg,
            });
        }
        Ok(envelope.data)
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        self.request(reqwest::Method::GET, path, None, false).await
    }

    async fn get_signed<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        self.request(reqwest::Method::GET, path, None, true).await
    }

    async fn post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Vec<T>> {
        self.request(reqwest::Method::POST, path, Some(body), true)
            .await
    }

    /// First element of a response, or an exchange error naming the call.
    fn first<T>(mut data: Vec<T>, what: &str) -> Result<T> {
        if data.is_empty() {
            return Err(BotError::exchange("empty", format!("no data for {what}")));
        }
        Ok(data.remove(0))
    }
}

#[async_trait]
impl ExchangeGateway for OkxClient {
    #[instrument(skip(self))]
    async fn get_ticker(&self, inst_id: &str) -> Result<Ticker> {
        let path = format!(
            "/api/v5/market/ticker?instId={}",
            urlencoding::encode(inst_id)
        );
        Self::first(self.get_public(&path).await?, "ticker")
    }

    async fn subscribe_tickers(&self, inst_ids: &[String]) -> Result<mpsc::Receiver<TickerEvent>> {
        websocket::subscribe_tickers(&self.ws_url, inst_ids).await
    }

    #[instrument(skip(self))]
    async fn get_instrument(&self, inst_id: &str, market: Market) -> Result<InstrumentSpec> {
        let inst_type = match market {
            Market::Spot => "SPOT",
            Market::Swap => "SWAP",
        };
        let path = format!(
            "/api/v5/public/instruments?instType={}&instId={}",
            inst_type,
            urlencoding::encode(inst_id)
        );
        Self::first(self.get_public(&path).await?, "instrument")
    }

    #[instrument(skip(self), fields(inst_id = %order.inst_id, side = ?order.side, size = %order.size))]
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let td_mode = match order.market {
            Market::Spot => "cash",
            Market::Swap => "isolated",
        };
        let ord_type = match order.order_type {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
            OrderType::Fok => "fok",
        };
        let side = match order.side {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };
        let mut body = json!({
            "instId": order.inst_id,
            "tdMode": td_mode,
            "side": side,
            "ordType": ord_type,
            "sz": order.size.to_string(),
        });
        if let Some(price) = order.price {
            body["px"] = json!(price.to_string());
        }

        debug!(body = %body, "placing order");
        let ack: RawOrderAck =
            Self::first(self.post_signed("/api/v5/trade/order", body).await?, "order")?;
        if ack.s_code != "0" {
            return Err(BotError::Exchange {
                code: ack.s_code,
                message: ack.s_msg,
            });
        }
        // Fill state is not in the placement response; callers poll.
        Ok(OrderAck {
            order_id: ack.order_id,
            state: OrderState::Live,
        })
    }

    #[instrument(skip(self))]
    async fn get_order(&self, inst_id: &str, order_id: &str) -> Result<OrderDetail> {
        let path = format!(
            "/api/v5/trade/order?instId={}&ordId={}",
            urlencoding::encode(inst_id),
            urlencoding::encode(order_id)
        );
        let raw: RawOrderDetail = Self::first(self.get_signed(&path).await?, "order detail")?;
        Ok(OrderDetail {
            order_id: raw.order_id,
            state: raw.state,
            filled_size: raw.filled_size,
            avg_price: raw.avg_price,
            fee: raw.fee,
        })
    }

    #[instrument(skip(self, order_ids))]
    async fn cancel_orders(&self, inst_id: &str, order_ids: &[String]) -> Result<()> {
        if order_ids.is_empty() {
            return Ok(());
        }
        let body: Vec<_> = order_ids
            .iter()
            .map(|id| json!({ "instId": inst_id, "ordId": id }))
            .collect();
        let _: Vec<serde_json::Value> = self
            .post_signed("/api/v5/trade/cancel-batch-orders", json!(body))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_leverage(&self, inst_id: &str) -> Result<LeverageSetting> {
        let path = format!(
            "/api/v5/account/leverage-info?instId={}&mgnMode=isolated",
            urlencoding::encode(inst_id)
        );
        let raw: RawLeverage = Self::first(self.get_signed(&path).await?, "leverage")?;
        Ok(LeverageSetting {
            leverage: raw.lever,
            isolated: raw.margin_mode == "isolated",
        })
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, inst_id: &str, leverage: u32) -> Result<()> {
        let body = json!({
            "instId": inst_id,
            "lever": leverage.to_string(),
            "mgnMode": "isolated",
        });
        let _: Vec<serde_json::Value> =
            self.post_signed("/api/v5/account/set-leverage", body).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_trade_fee(&self, inst_id: &str, market: Market) -> Result<TradeFee> {
        let inst_type = match market {
            Market::Spot => "SPOT",
            Market::Swap => "SWAP",
        };
        let path = format!(
            "/api/v5/account/trade-fee?instType={}&instId={}",
            inst_type,
            urlencoding::encode(inst_id)
        );
        let raw: RawTradeFee = Self::first(self.get_signed(&path).await?, "trade fee")?;
        // Venue quotes rebates as negative rates; store positive costs.
        Ok(TradeFee {
            taker: raw.taker.abs(),
            maker: raw.maker.abs(),
        })
    }

    #[instrument(skip(self))]
    async fn get_balance(&self) -> Result<Balance> {
        let raw: RawBalance = Self::first(
            self.get_signed("/api/v5/account/balance?ccy=USDT").await?,
            "balance",
        )?;
        let detail = raw
            .details
            .into_iter()
            .find(|d| d.ccy == "USDT")
            .unwrap_or(RawBalanceDetail {
                ccy: "USDT".to_string(),
                eq: Decimal::ZERO,
                avail: Decimal::ZERO,
            });
        Ok(Balance {
            total: detail.eq,
            available: detail.avail,
        })
    }

    #[instrument(skip(self))]
    async fn get_spot_holding(&self, currency: &str) -> Result<Decimal> {
        let path = format!(
            "/api/v5/account/balance?ccy={}",
            urlencoding::encode(currency)
        );
        let raw: RawBalance = Self::first(self.get_signed(&path).await?, "holding")?;
        Ok(raw
            .details
            .into_iter()
            .find(|d| d.ccy == currency)
            .map(|d| d.eq)
            .unwrap_or(Decimal::ZERO))
    }

    #[instrument(skip(self))]
    async fn get_swap_position(&self, inst_id: &str) -> Result<Option<SwapPosition>> {
        let path = format!(
            "/api/v5/account/positions?instId={}",
            urlencoding::encode(inst_id)
        );
        let positions: Vec<RawPosition> = self.get_signed(&path).await?;
        let Some(raw) = positions.into_iter().find(|p| p.contracts != Decimal::ZERO) else {
            return Ok(None);
        };
        Ok(Some(SwapPosition {
            contracts: raw.contracts,
            avg_price: raw.avg_price,
            liquidation_price: raw.liquidation_price,
            margin: raw.margin,
            unrealized_pnl: raw.unrealized_pnl,
            leverage: raw.lever,
            last: raw.last,
        }))
    }

    #[instrument(skip(self))]
    async fn get_funding_info(&self, inst_id: &str) -> Result<FundingInfo> {
        let path = format!(
            "/api/v5/public/funding-rate?instId={}",
            urlencoding::encode(inst_id)
        );
        Self::first(self.get_public(&path).await?, "funding rate")
    }

    #[instrument(skip(self))]
    async fn get_account_bills(&self, bill_type: BillType, limit: usize) -> Result<Vec<Bill>> {
        let type_code = match bill_type {
            BillType::Funding => "8",
            BillType::Fee => "2",
            BillType::Other => "1",
        };
        let path = format!("/api/v5/account/bills?type={}&limit={}", type_code, limit);
        let raw: Vec<RawBill> = self.get_signed(&path).await?;
        Ok(raw
            .into_iter()
            .map(|b| Bill {
                inst_id: b.inst_id,
                bill_type: match b.bill_type.as_str() {
                    "8" => BillType::Funding,
                    "2" => BillType::Fee,
                    _ => BillType::Other,
                },
                pnl: b.pnl,
                timestamp: DateTime::from_timestamp_millis(b.ts).unwrap_or_default(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn adjust_position_margin(&self, inst_id: &str, amount: Decimal) -> Result<()> {
        let (adjust_type, amt) = if amount >= Decimal::ZERO {
            ("add", amount)
        } else {
            ("reduce", -amount)
        };
        let body = json!({
            "instId": inst_id,
            "posSide": "net",
            "type": adjust_type,
            "amt": amt.to_string(),
        });
        let _: Vec<serde_json::Value> = self
            .post_signed("/api/v5/account/position/margin-balance", body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_rejection_becomes_exchange_error() {
        let json = r#"{"code": "51000", "msg": "Parameter error", "data": []}"#;
        let envelope: ApiResponse<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.code, "51000");
        assert!(envelope.data.is_empty());
    }

    #[test]
    fn test_order_detail_parses_empty_fill_fields() {
        let json = r#"{
            "ordId": "12345",
            "state": "live",
            "accFillSz": "",
            "avgPx": "",
            "fee": ""
        }"#;
        let raw: RawOrderDetail = serde_json::from_str(json).unwrap();
        assert_eq!(raw.state, OrderState::Live);
        assert_eq!(raw.filled_size, Decimal::ZERO);
    }

    #[test]
    fn test_position_parses_short() {
        let json = r#"{
            "pos": "-120",
            "avgPx": "50000",
            "liqPx": "74000",
            "margin": "2000",
            "upl": "-12.5",
            "lever": "3",
            "last": "50100"
        }"#;
        let raw: RawPosition = serde_json::from_str(json).unwrap();
        assert!(raw.contracts < Decimal::ZERO);
        assert_eq!(raw.liquidation_price, rust_decimal_macros::dec!(74000));
    }
}
