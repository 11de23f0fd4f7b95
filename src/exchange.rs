//! Venue-neutral exchange capability (§6): connection lifecycle,
//! subscriptions, order operations, symbol metadata.
//!
//! Grounded on the teacher's `ExchangeClient` trait, generalized to the
//! spec's capability set and stripped of Hyperliquid-only methods
//! (`sweep_dead_orders`, `withdraw`, `as_sim_mut` downcasting). `SimExchange`
//! keeps the teacher's in-memory fill model; `LiveExchange` is a worked
//! reference adapter, not part of the core contract.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VenueError;
use crate::market_data::{L2Book, PriceLevel, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub exchange_id: String,
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub filled: f64,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub tick_size: f64,
    pub lot_step: f64,
    pub min_notional: Option<f64>,
}

/// Venue capability set, independent of wire protocol. Core components
/// depend only on this trait, never on a concrete venue adapter.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn connect(&mut self) -> Result<(), VenueError>;
    async fn disconnect(&mut self) -> Result<(), VenueError>;
    fn is_connected(&self) -> bool;

    async fn subscribe_order_book(&mut self, symbol: &str) -> Result<(), VenueError>;
    async fn subscribe_trades(&mut self, symbol: &str) -> Result<(), VenueError>;
    async fn unsubscribe_order_book(&mut self, symbol: &str) -> Result<(), VenueError>;
    async fn unsubscribe_trades(&mut self, symbol: &str) -> Result<(), VenueError>;

    async fn place_order(&mut self, request: OrderRequest) -> Result<Order, VenueError>;
    async fn cancel_order(&mut self, id: &str, symbol: &str) -> Result<bool, VenueError>;
    async fn get_order(&mut self, id: &str, symbol: &str) -> Result<Order, VenueError>;
    async fn get_open_orders(&mut self, symbol: &str) -> Result<Vec<Order>, VenueError>;
    async fn get_positions(&mut self) -> Result<HashMap<String, Position>, VenueError>;
    async fn get_balance(&mut self) -> Result<f64, VenueError>;
    async fn get_order_book(&mut self, symbol: &str, depth: usize) -> Result<L2Book, VenueError>;

    fn symbol_meta(&self, symbol: &str) -> Option<SymbolMeta>;
}

/// In-process fill simulator for tests and shadow-mode operation. Fills
/// every post-only order immediately at its requested price, grounded on
/// the teacher's `SimExchange` immediate-fill model.
pub struct SimExchange {
    connected: bool,
    balance: f64,
    positions: HashMap<String, Position>,
    orders: HashMap<String, Order>,
    next_order_id: u64,
    maker_fee: f64,
    symbol_meta: HashMap<String, SymbolMeta>,
}

impl SimExchange {
    pub fn new(initial_balance: f64, maker_fee: f64) -> Self {
        Self {
            connected: false,
            balance: initial_balance,
            positions: HashMap::new(),
            orders: HashMap::new(),
            next_order_id: 1,
            maker_fee,
            symbol_meta: HashMap::new(),
        }
    }

    pub fn set_symbol_meta(&mut self, symbol: &str, meta: SymbolMeta) {
        self.symbol_meta.insert(symbol.to_string(), meta);
    }

    fn next_id(&mut self) -> String {
        let id = self.next_order_id;
        self.next_order_id += 1;
        format!("sim-{}", id)
    }
}

#[async_trait]
impl Exchange for SimExchange {
    async fn connect(&mut self) -> Result<(), VenueError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), VenueError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn subscribe_order_book(&mut self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn subscribe_trades(&mut self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn unsubscribe_order_book(&mut self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn unsubscribe_trades(&mut self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn place_order(&mut self, request: OrderRequest) -> Result<Order, VenueError> {
        let price = request
            .price
            .ok_or_else(|| VenueError::Rejected("market orders unsupported in sim".into()))?;
        let notional = price * request.amount;
        let fee = notional * self.maker_fee;
        if self.balance < fee {
            return Err(VenueError::InsufficientMargin);
        }
        self.balance -= fee;

        let id = self.next_id();
        let order = Order {
            exchange_id: id.clone(),
            client_id: request.client_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            price,
            amount: request.amount,
            filled: request.amount,
            status: OrderStatus::Filled,
        };

        let pos = self.positions.entry(request.symbol.clone()).or_insert(Position {
            size: 0.0,
            entry_price: price,
            unrealized_pnl: 0.0,
        });
        match request.side {
            Side::Buy => pos.size += request.amount,
            Side::Sell => pos.size -= request.amount,
        }

        self.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&mut self, id: &str, _symbol: &str) -> Result<bool, VenueError> {
        Ok(self.orders.remove(id).is_some())
    }

    async fn get_order(&mut self, id: &str, _symbol: &str) -> Result<Order, VenueError> {
        self.orders.get(id).cloned().ok_or_else(|| VenueError::UnknownOrder(id.to_string()))
    }

    async fn get_open_orders(&mut self, symbol: &str) -> Result<Vec<Order>, VenueError> {
        Ok(self.orders.values().filter(|o| o.symbol == symbol).cloned().collect())
    }

    async fn get_positions(&mut self) -> Result<HashMap<String, Position>, VenueError> {
        Ok(self.positions.clone())
    }

    async fn get_balance(&mut self) -> Result<f64, VenueError> {
        Ok(self.balance)
    }

    async fn get_order_book(&mut self, _symbol: &str, _depth: usize) -> Result<L2Book, VenueError> {
        Err(VenueError::Network("sim exchange has no book endpoint; feed via ingestion".into()))
    }

    fn symbol_meta(&self, symbol: &str) -> Option<SymbolMeta> {
        self.symbol_meta.get(symbol).copied()
    }
}

/// Reference REST adapter. Kept as a worked example of how a venue plugs
/// into the `Exchange` trait; its signing scheme is venue-specific and not
/// part of the core contract. Uses simple API-key header auth rather than
/// the teacher's Hyperliquid L1 action signing, which this crate drops.
pub struct LiveExchange {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    connected: bool,
    symbol_meta: HashMap<String, SymbolMeta>,
    cached_balance: Option<(f64, Instant)>,
    cache_ttl: Duration,
}

impl LiveExchange {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
            connected: false,
            symbol_meta: HashMap::new(),
            cached_balance: None,
            cache_ttl: Duration::from_secs(2),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("X-API-KEY", &self.api_key)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authed(self.client.get(&url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| VenueError::Network(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VenueError::RateLimited);
        }
        resp.json().await.map_err(|e| VenueError::Network(e.to_string()))
    }
}

#[async_trait]
impl Exchange for LiveExchange {
    async fn connect(&mut self) -> Result<(), VenueError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), VenueError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn subscribe_order_book(&mut self, _symbol: &str) -> Result<(), VenueError> {
        // Book/trade streaming is owned by `ingestion.rs`'s WebSocket task,
        // not this REST adapter; subscription acks are a no-op here.
        Ok(())
    }

    async fn subscribe_trades(&mut self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn unsubscribe_order_book(&mut self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn unsubscribe_trades(&mut self, _symbol: &str) -> Result<(), VenueError> {
        Ok(())
    }

    async fn place_order(&mut self, request: OrderRequest) -> Result<Order, VenueError> {
        let url = format!("{}/orders", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .json(&request)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| VenueError::Network(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VenueError::RateLimited);
        }
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VenueError::Rejected(body));
        }
        resp.json().await.map_err(|e| VenueError::Network(e.to_string()))
    }

    async fn cancel_order(&mut self, id: &str, symbol: &str) -> Result<bool, VenueError> {
        let url = format!("{}/orders/{}?symbol={}", self.base_url, id, symbol);
        let resp = self
            .authed(self.client.delete(&url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| VenueError::Network(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    async fn get_order(&mut self, id: &str, symbol: &str) -> Result<Order, VenueError> {
        let v = self.get_json(&format!("/orders/{}?symbol={}", id, symbol)).await?;
        serde_json::from_value(v).map_err(|e| VenueError::Network(e.to_string()))
    }

    async fn get_open_orders(&mut self, symbol: &str) -> Result<Vec<Order>, VenueError> {
        let v = self.get_json(&format!("/orders/open?symbol={}", symbol)).await?;
        serde_json::from_value(v).map_err(|e| VenueError::Network(e.to_string()))
    }

    async fn get_positions(&mut self) -> Result<HashMap<String, Position>, VenueError> {
        let v = self.get_json("/positions").await?;
        serde_json::from_value(v).map_err(|e| VenueError::Network(e.to_string()))
    }

    async fn get_balance(&mut self) -> Result<f64, VenueError> {
        if let Some((bal, at)) = self.cached_balance {
            if at.elapsed() < self.cache_ttl {
                return Ok(bal);
            }
        }
        let v = self.get_json("/balance").await?;
        let bal = v["balance"].as_f64().ok_or_else(|| VenueError::Network("missing balance field".into()))?;
        self.cached_balance = Some((bal, Instant::now()));
        Ok(bal)
    }

    async fn get_order_book(&mut self, symbol: &str, depth: usize) -> Result<L2Book, VenueError> {
        let v = self.get_json(&format!("/book?symbol={}&depth={}", symbol, depth)).await?;
        let bids: Vec<PriceLevel> = serde_json::from_value(v["bids"].clone()).map_err(|e| VenueError::Network(e.to_string()))?;
        let asks: Vec<PriceLevel> = serde_json::from_value(v["asks"].clone()).map_err(|e| VenueError::Network(e.to_string()))?;
        let sequence = v["sequence"].as_u64().unwrap_or(0);
        Ok(L2Book { bids, asks, sequence, timestamp: chrono::Utc::now() })
    }

    fn symbol_meta(&self, symbol: &str) -> Option<SymbolMeta> {
        self.symbol_meta.get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(side: Side, price: f64, amount: f64) -> OrderRequest {
        OrderRequest {
            symbol: "BTC-USD".into(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            time_in_force: TimeInForce::Gtx,
            post_only: true,
            client_id: Some("cid-1".into()),
        }
    }

    #[tokio::test]
    async fn sim_buy_fills_immediately_and_updates_position() {
        let mut ex = SimExchange::new(10_000.0, 0.0002);
        let order = ex.place_order(request(Side::Buy, 100.0, 1.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        let positions = ex.get_positions().await.unwrap();
        assert_eq!(positions["BTC-USD"].size, 1.0);
    }

    #[tokio::test]
    async fn sim_rejects_when_balance_insufficient_for_fee() {
        let mut ex = SimExchange::new(0.0, 0.01);
        let result = ex.place_order(request(Side::Buy, 100.0, 1.0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sim_cancel_unknown_order_returns_false() {
        let mut ex = SimExchange::new(10_000.0, 0.0002);
        let cancelled = ex.cancel_order("does-not-exist", "BTC-USD").await.unwrap();
        assert!(!cancelled);
    }
}
