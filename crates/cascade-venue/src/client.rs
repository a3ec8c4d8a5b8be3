//! Typed venue operations over signed REST.

use crate::error::{VenueError, VenueResult};
use crate::signer::Signer;
use crate::spec_cache::SpecCache;
use crate::types::{
    AccountInfo, BatchItem, DepthSnapshot, ErrorBody, ExchangeInfo, ListenKey, MultiAssetsInfo,
    OpenOrder, OrderAck, PositionModeInfo, PositionRisk,
};
use async_trait::async_trait;
use cascade_core::{
    ClientOrderId, MarginType, PositionSide, Price, Qty, Side, Symbol, SymbolSpec, TimeInForce,
    WorkingType,
};
use cascade_governor::{Endpoint, GovernorError, Priority, RateGovernor};
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Venue order type for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// A new order to submit.
///
/// Prices and quantities must already be rounded to the symbol spec.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub qty: Qty,
    pub price: Option<Price>,
    pub stop_price: Option<Price>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub working_type: Option<WorkingType>,
    pub price_protect: bool,
    pub client_id: Option<ClientOrderId>,
}

impl NewOrder {
    /// Build request parameters.
    ///
    /// Under hedge mode the venue rejects `reduceOnly` together with an
    /// explicit `positionSide`, so the flag is omitted there; the explicit
    /// position side already restricts the order to reducing that position.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let hedged = self.position_side != PositionSide::Both;
        let mut params: Vec<(String, String)> = vec![
            ("symbol".into(), self.symbol.to_string()),
            ("side".into(), self.side.to_string()),
            ("type".into(), self.order_type.as_str().into()),
            ("quantity".into(), self.qty.to_string()),
            ("positionSide".into(), self.position_side.to_string()),
        ];
        if let Some(price) = self.price {
            params.push(("price".into(), price.to_string()));
        }
        if let Some(stop) = self.stop_price {
            params.push(("stopPrice".into(), stop.to_string()));
        }
        if let Some(tif) = self.time_in_force {
            params.push(("timeInForce".into(), tif.to_string()));
        }
        if self.reduce_only && !hedged {
            params.push(("reduceOnly".into(), "true".into()));
        }
        if let Some(wt) = self.working_type {
            params.push(("workingType".into(), wt.to_string()));
        }
        if self.price_protect {
            params.push(("priceProtect".into(), "TRUE".into()));
        }
        if let Some(ref cid) = self.client_id {
            params.push(("newClientOrderId".into(), cid.to_string()));
        }
        params.push(("newOrderRespType".into(), "RESULT".into()));
        params
    }
}

/// Venue operations used by the engine. Implemented over HTTP in
/// production and by fakes in tests.
#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn exchange_info(&self) -> VenueResult<Vec<SymbolSpec>>;
    /// Cached symbol spec, refreshed when missing or stale.
    async fn symbol_spec(&self, symbol: &Symbol) -> VenueResult<SymbolSpec>;
    async fn depth(&self, symbol: &Symbol, limit: u32, priority: Priority)
        -> VenueResult<DepthSnapshot>;
    async fn place_order(&self, order: &NewOrder, priority: Priority) -> VenueResult<OrderAck>;
    /// Submit up to five orders in one call. Each slot succeeds or fails
    /// independently.
    async fn place_batch(
        &self,
        orders: &[NewOrder],
        priority: Priority,
    ) -> VenueResult<Vec<VenueResult<OrderAck>>>;
    /// Cancel an order. Cancelling an already-terminal order is a no-op
    /// that returns success.
    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        priority: Priority,
    ) -> VenueResult<()>;
    async fn cancel_all_open(&self, symbol: &Symbol) -> VenueResult<()>;
    async fn open_orders(&self, symbol: Option<&Symbol>) -> VenueResult<Vec<OpenOrder>>;
    async fn account(&self) -> VenueResult<AccountInfo>;
    async fn position_risk(&self) -> VenueResult<Vec<PositionRisk>>;
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> VenueResult<()>;
    async fn set_margin_type(&self, symbol: &Symbol, margin: MarginType) -> VenueResult<()>;
    async fn set_position_mode(&self, hedge: bool) -> VenueResult<()>;
    async fn get_position_mode(&self) -> VenueResult<bool>;
    async fn set_multi_assets_mode(&self, enabled: bool) -> VenueResult<()>;
    async fn get_multi_assets_mode(&self) -> VenueResult<bool>;
    async fn listen_key_create(&self) -> VenueResult<String>;
    async fn listen_key_keepalive(&self) -> VenueResult<()>;
    async fn listen_key_delete(&self) -> VenueResult<()>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct VenueClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    /// Per-call deadline covering all retries.
    pub call_deadline: Duration,
    pub max_retries: u32,
}

impl VenueClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err("api_key and api_secret must be set".into());
        }
        if !self.base_url.starts_with("http") {
            return Err(format!("invalid base_url: {}", self.base_url));
        }
        Ok(())
    }
}

/// Production venue client.
pub struct HttpVenueClient {
    http: reqwest::Client,
    config: VenueClientConfig,
    signer: Signer,
    governor: Arc<RateGovernor>,
    specs: Arc<SpecCache>,
}

impl HttpVenueClient {
    pub fn new(
        config: VenueClientConfig,
        governor: Arc<RateGovernor>,
        specs: Arc<SpecCache>,
    ) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VenueError::TransientNetwork(e.to_string()))?;
        let signer = Signer::new(config.api_secret.clone());
        Ok(Self {
            http,
            config,
            signer,
            governor,
            specs,
        })
    }

    pub fn spec_cache(&self) -> Arc<SpecCache> {
        self.specs.clone()
    }

    fn canonical_query(params: &[(String, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push((
            "timestamp".into(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ));
        params.push(("recvWindow".into(), self.config.recv_window_ms.to_string()));
        let qs = Self::canonical_query(&params);
        let sig = self.signer.sign(&qs);
        format!("{qs}&signature={sig}")
    }

    async fn parse_error(&self, status: u16, body: &str) -> VenueError {
        if status == 429 {
            let backoff = self
                .governor
                .on_response(429, None)
                .unwrap_or(Duration::from_secs(1));
            return VenueError::RateLimited {
                retry_after: backoff,
            };
        }
        if status == 418 {
            let ban = self
                .governor
                .on_response(418, None)
                .unwrap_or(Duration::from_secs(120));
            return VenueError::Banned { remaining: ban };
        }
        if status == 401 || status == 403 {
            return VenueError::Auth(body.to_string());
        }
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(e) => {
                let err = VenueError::from_code(e.code, e.msg);
                if err.invalidates_spec() {
                    // The spec cache may be out of date with the venue's
                    // lot/tick rules; force a refetch on next lookup.
                    debug!("lot/tick error, marking spec cache stale");
                }
                err
            }
            Err(_) => VenueError::UnknownVenue {
                code: status as i32,
                msg: body.to_string(),
            },
        }
    }

    fn feed_quota_headers(&self, headers: &reqwest::header::HeaderMap) {
        let mut used_weight = None;
        let mut order_count = None;
        for (name, value) in headers {
            let name = name.as_str().to_ascii_uppercase();
            if name.starts_with("X-MBX-USED-WEIGHT") {
                used_weight = value.to_str().ok().and_then(|v| v.parse().ok());
            } else if name.starts_with("X-MBX-ORDER-COUNT") {
                order_count = value.to_str().ok().and_then(|v| v.parse().ok());
            }
        }
        if used_weight.is_some() || order_count.is_some() {
            self.governor.on_headers(used_weight, order_count);
        }
    }

    /// Issue one signed request through the governor, without retries.
    async fn request_once(
        &self,
        method: Method,
        path: &str,
        endpoint: Endpoint,
        params: Vec<(String, String)>,
        priority: Priority,
        signed: bool,
    ) -> VenueResult<String> {
        self.governor
            .wait_for_admission(&endpoint, priority)
            .await
            .map_err(|e| match e {
                GovernorError::Banned { remaining } => VenueError::Banned { remaining },
                GovernorError::RateLimited { retry_after } => {
                    VenueError::RateLimited { retry_after }
                }
                GovernorError::QueueFull { .. } => VenueError::RateLimited {
                    retry_after: Duration::from_secs(1),
                },
            })?;

        let query = if signed {
            self.signed_query(params)
        } else {
            Self::canonical_query(&params)
        };
        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, path)
        } else {
            format!("{}{}?{}", self.config.base_url, path, query)
        };

        self.governor.record(&endpoint);
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    VenueError::TransientNetwork(e.to_string())
                } else {
                    VenueError::TransientNetwork(format!("request error: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        self.feed_quota_headers(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| VenueError::TransientNetwork(e.to_string()))?;

        if status < 400 {
            self.governor.on_response(status, None);
            Ok(body)
        } else {
            Err(self.parse_error(status, &body).await)
        }
    }

    /// Issue a request, retrying transient/rate-limited failures with
    /// exponential backoff under the per-call deadline.
    async fn request(
        &self,
        method: Method,
        path: &str,
        endpoint: Endpoint,
        params: Vec<(String, String)>,
        priority: Priority,
        signed: bool,
    ) -> VenueResult<String> {
        let deadline = Instant::now() + self.config.call_deadline;
        let mut attempt = 0u32;
        loop {
            match self
                .request_once(
                    method.clone(),
                    path,
                    endpoint,
                    params.clone(),
                    priority,
                    signed,
                )
                .await
            {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = match &e {
                        VenueError::RateLimited { retry_after } => *retry_after,
                        _ => Duration::from_millis(200 * (1 << attempt.min(5))),
                    };
                    if Instant::now() + backoff >= deadline {
                        warn!(path, attempt, "Call deadline exhausted, giving up");
                        return Err(e);
                    }
                    debug!(path, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &str) -> VenueResult<T> {
        serde_json::from_str(body).map_err(|e| VenueError::UnknownVenue {
            code: 0,
            msg: format!("decode error: {e}; body: {body}"),
        })
    }
}

#[async_trait]
impl VenueClient for HttpVenueClient {
    async fn exchange_info(&self) -> VenueResult<Vec<SymbolSpec>> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/exchangeInfo",
                Endpoint::ExchangeInfo,
                vec![],
                Priority::Low,
                false,
            )
            .await?;
        let info: ExchangeInfo = Self::decode(&body)?;
        let specs: Vec<SymbolSpec> = info.symbols.iter().filter_map(|s| s.to_spec()).collect();
        info!(count = specs.len(), "Fetched exchange info");
        Ok(specs)
    }

    async fn symbol_spec(&self, symbol: &Symbol) -> VenueResult<SymbolSpec> {
        if self.specs.is_stale() || self.specs.get(symbol).is_none() {
            let specs = self.exchange_info().await?;
            self.specs.replace(specs);
        }
        self.specs
            .get(symbol)
            .ok_or_else(|| VenueError::InvalidParam {
                code: -1121,
                msg: format!("unknown symbol {symbol}"),
            })
    }

    async fn depth(
        &self,
        symbol: &Symbol,
        limit: u32,
        priority: Priority,
    ) -> VenueResult<DepthSnapshot> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/depth",
                Endpoint::Depth { limit },
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("limit".into(), limit.to_string()),
                ],
                priority,
                false,
            )
            .await?;
        Self::decode(&body)
    }

    async fn place_order(&self, order: &NewOrder, priority: Priority) -> VenueResult<OrderAck> {
        let result = self
            .request(
                Method::POST,
                "/fapi/v1/order",
                Endpoint::Order,
                order.to_params(),
                priority,
                true,
            )
            .await;
        match result {
            Ok(body) => Self::decode(&body),
            Err(e) => {
                if e.invalidates_spec() {
                    self.specs.invalidate(&order.symbol);
                }
                Err(e)
            }
        }
    }

    async fn place_batch(
        &self,
        orders: &[NewOrder],
        priority: Priority,
    ) -> VenueResult<Vec<VenueResult<OrderAck>>> {
        if orders.is_empty() {
            return Ok(vec![]);
        }
        if orders.len() > 5 {
            return Err(VenueError::InvalidParam {
                code: -1128,
                msg: format!("batch size {} exceeds limit of 5", orders.len()),
            });
        }
        let batch: Vec<serde_json::Map<String, serde_json::Value>> = orders
            .iter()
            .map(|o| {
                o.to_params()
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect()
            })
            .collect();
        let batch_json = serde_json::to_string(&batch).expect("string map serializes");
        let body = self
            .request(
                Method::POST,
                "/fapi/v1/batchOrders",
                Endpoint::BatchOrders,
                vec![("batchOrders".into(), batch_json)],
                priority,
                true,
            )
            .await?;
        let items: Vec<BatchItem> = Self::decode(&body)?;
        Ok(items
            .into_iter()
            .map(|item| match item {
                BatchItem::Ack(ack) => Ok(ack),
                BatchItem::Err(e) => Err(VenueError::from_code(e.code, e.msg)),
            })
            .collect())
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        priority: Priority,
    ) -> VenueResult<()> {
        let result = self
            .request(
                Method::DELETE,
                "/fapi/v1/order",
                Endpoint::Order,
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("orderId".into(), order_id.to_string()),
                ],
                priority,
                true,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Already filled/canceled: treat as success.
            Err(VenueError::OrderNotFound) => {
                debug!(%symbol, order_id, "Cancel target already terminal");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_open(&self, symbol: &Symbol) -> VenueResult<()> {
        self.request(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            Endpoint::AllOpenOrders { all_symbols: false },
            vec![("symbol".into(), symbol.to_string())],
            Priority::Normal,
            true,
        )
        .await?;
        Ok(())
    }

    async fn open_orders(&self, symbol: Option<&Symbol>) -> VenueResult<Vec<OpenOrder>> {
        let (params, endpoint) = match symbol {
            Some(s) => (
                vec![("symbol".into(), s.to_string())],
                Endpoint::OpenOrders { all_symbols: false },
            ),
            None => (vec![], Endpoint::OpenOrders { all_symbols: true }),
        };
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/openOrders",
                endpoint,
                params,
                Priority::Low,
                true,
            )
            .await?;
        Self::decode(&body)
    }

    async fn account(&self) -> VenueResult<AccountInfo> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v2/account",
                Endpoint::Account,
                vec![],
                Priority::Low,
                true,
            )
            .await?;
        Self::decode(&body)
    }

    async fn position_risk(&self) -> VenueResult<Vec<PositionRisk>> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v2/positionRisk",
                Endpoint::PositionRisk,
                vec![],
                Priority::Low,
                true,
            )
            .await?;
        Self::decode(&body)
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> VenueResult<()> {
        self.request(
            Method::POST,
            "/fapi/v1/leverage",
            Endpoint::Leverage,
            vec![
                ("symbol".into(), symbol.to_string()),
                ("leverage".into(), leverage.to_string()),
            ],
            Priority::Normal,
            true,
        )
        .await?;
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &Symbol, margin: MarginType) -> VenueResult<()> {
        let result = self
            .request(
                Method::POST,
                "/fapi/v1/marginType",
                Endpoint::MarginType,
                vec![
                    ("symbol".into(), symbol.to_string()),
                    ("marginType".into(), margin.to_string()),
                ],
                Priority::Normal,
                true,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // -4046: no need to change margin type.
            Err(VenueError::UnknownVenue { code: -4046, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_position_mode(&self, hedge: bool) -> VenueResult<()> {
        let result = self
            .request(
                Method::POST,
                "/fapi/v1/positionSide/dual",
                Endpoint::PositionMode,
                vec![(
                    "dualSidePosition".into(),
                    if hedge { "true" } else { "false" }.into(),
                )],
                Priority::Normal,
                true,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // -4059: no need to change position side.
            Err(VenueError::UnknownVenue { code: -4059, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_position_mode(&self) -> VenueResult<bool> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/positionSide/dual",
                Endpoint::PositionMode,
                vec![],
                Priority::Normal,
                true,
            )
            .await?;
        let info: PositionModeInfo = Self::decode(&body)?;
        Ok(info.dual_side_position)
    }

    async fn set_multi_assets_mode(&self, enabled: bool) -> VenueResult<()> {
        let result = self
            .request(
                Method::POST,
                "/fapi/v1/multiAssetsMargin",
                Endpoint::MultiAssetsMargin,
                vec![(
                    "multiAssetsMargin".into(),
                    if enabled { "true" } else { "false" }.into(),
                )],
                Priority::Normal,
                true,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(VenueError::UnknownVenue { code: -4171, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_multi_assets_mode(&self) -> VenueResult<bool> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/multiAssetsMargin",
                Endpoint::MultiAssetsMargin,
                vec![],
                Priority::Normal,
                true,
            )
            .await?;
        let info: MultiAssetsInfo = Self::decode(&body)?;
        Ok(info.multi_assets_margin)
    }

    async fn listen_key_create(&self) -> VenueResult<String> {
        let body = self
            .request(
                Method::POST,
                "/fapi/v1/listenKey",
                Endpoint::ListenKey,
                vec![],
                Priority::Normal,
                true,
            )
            .await?;
        let key: ListenKey = Self::decode(&body)?;
        info!("Created user-data listen key");
        Ok(key.listen_key)
    }

    async fn listen_key_keepalive(&self) -> VenueResult<()> {
        self.request(
            Method::PUT,
            "/fapi/v1/listenKey",
            Endpoint::ListenKey,
            vec![],
            Priority::Normal,
            true,
        )
        .await?;
        Ok(())
    }

    async fn listen_key_delete(&self) -> VenueResult<()> {
        let result = self
            .request(
                Method::DELETE,
                "/fapi/v1/listenKey",
                Endpoint::ListenKey,
                vec![],
                Priority::Low,
                true,
            )
            .await;
        if let Err(ref e) = result {
            error!(error = %e, "Failed to delete listen key");
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order() -> NewOrder {
        NewOrder {
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Sell,
            position_side: PositionSide::Long,
            order_type: OrderType::Limit,
            qty: Qty::new(dec!(0.02)),
            price: Some(Price::new(dec!(61138.8))),
            stop_price: None,
            time_in_force: Some(TimeInForce::Gtc),
            reduce_only: true,
            working_type: None,
            price_protect: false,
            client_id: None,
        }
    }

    #[test]
    fn test_hedge_mode_omits_reduce_only() {
        let params = order().to_params();
        assert!(params.iter().any(|(k, v)| k == "positionSide" && v == "LONG"));
        // Hedge mode: reduceOnly must not be sent with positionSide.
        assert!(!params.iter().any(|(k, _)| k == "reduceOnly"));
    }

    #[test]
    fn test_one_way_mode_keeps_reduce_only() {
        let mut o = order();
        o.position_side = PositionSide::Both;
        let params = o.to_params();
        assert!(params.iter().any(|(k, v)| k == "reduceOnly" && v == "true"));
    }

    #[test]
    fn test_stop_market_params() {
        let mut o = order();
        o.order_type = OrderType::StopMarket;
        o.price = None;
        o.stop_price = Some(Price::new(dec!(59340.6)));
        o.time_in_force = None;
        o.working_type = Some(WorkingType::MarkPrice);
        let params = o.to_params();
        assert!(params.iter().any(|(k, v)| k == "type" && v == "STOP_MARKET"));
        assert!(params.iter().any(|(k, v)| k == "stopPrice" && v == "59340.6"));
        assert!(params.iter().any(|(k, v)| k == "workingType" && v == "MARK_PRICE"));
        assert!(!params.iter().any(|(k, _)| k == "price"));
        assert!(!params.iter().any(|(k, _)| k == "timeInForce"));
    }

    #[test]
    fn test_canonical_query_encoding() {
        let qs = HttpVenueClient::canonical_query(&[
            ("symbol".into(), "BTCUSDT".into()),
            ("batchOrders".into(), "[{\"a\":1}]".into()),
        ]);
        assert!(qs.starts_with("symbol=BTCUSDT&batchOrders="));
        assert!(!qs.contains('{'));
    }
}
