use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{
    AccountInfo, Error, OrderRequest, OrderResult, Position, PositionFilter, Result, SymbolInfo,
    Tick, Venue, VenueIdentity, VenueSession,
};

/// Venue adapter for a terminal bridge service speaking JSON over HTTP.
///
/// Each `connect` logs one strategy's account in and yields a session id
/// that scopes every later call. Request timeouts are enforced here.
pub struct BridgeVenue {
    base_url: String,
    http: Client,
}

impl BridgeVenue {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    strategy_id: &'a str,
    terminal: &'a str,
    login: u64,
    server: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    session_id: String,
}

#[async_trait]
impl Venue for BridgeVenue {
    async fn connect(&self, identity: &VenueIdentity) -> Result<Box<dyn VenueSession>> {
        let connect_fault = |reason: String| Error::VenueConnect {
            strategy: identity.strategy_id.clone(),
            reason,
        };
        let body = LoginRequest {
            strategy_id: &identity.strategy_id,
            terminal: &identity.terminal,
            login: identity.login,
            server: &identity.server,
            password: &identity.password,
        };
        let resp = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| connect_fault(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(connect_fault(format!("HTTP {status}: {text}")));
        }
        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| connect_fault(e.to_string()))?;
        debug!(
            strategy = %identity.strategy_id,
            session = %login.session_id,
            "Bridge session opened"
        );

        Ok(Box::new(BridgeSession {
            http: self.http.clone(),
            session_url: format!("{}/sessions/{}", self.base_url, login.session_id),
            strategy_id: identity.strategy_id.clone(),
        }))
    }
}

struct BridgeSession {
    http: Client,
    session_url: String,
    strategy_id: String,
}

impl BridgeSession {
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{path}", self.session_url))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        decode(resp).await
    }

    /// Like `get`, but a 404 means the instrument is unknown to the venue.
    async fn get_market<T: DeserializeOwned>(&self, path: &str, symbol: &str) -> Result<T> {
        match self.get(path).await {
            Err(Error::Venue(reason)) if reason.starts_with("HTTP 404") => {
                Err(Error::MarketData {
                    symbol: symbol.to_string(),
                    reason,
                })
            }
            other => other,
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
    if !status.is_success() {
        return Err(Error::Venue(format!("HTTP {status}: {text}")));
    }
    Ok(serde_json::from_str(&text)?)
}

#[async_trait]
impl VenueSession for BridgeSession {
    async fn account_info(&mut self) -> Result<AccountInfo> {
        self.get("/account").await
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo> {
        self.get_market(&format!("/symbols/{symbol}"), symbol).await
    }

    async fn tick(&mut self, symbol: &str) -> Result<Tick> {
        self.get_market(&format!("/ticks/{symbol}"), symbol).await
    }

    async fn positions_get(&mut self, filter: &PositionFilter) -> Result<Vec<Position>> {
        let mut query = Vec::new();
        if let Some(symbol) = &filter.symbol {
            query.push(("symbol", symbol.clone()));
        }
        if let Some(magic) = filter.magic {
            query.push(("magic", magic.to_string()));
        }
        let resp = self
            .http
            .get(format!("{}/positions", self.session_url))
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        decode(resp).await
    }

    async fn order_send(&mut self, request: &OrderRequest) -> Result<OrderResult> {
        debug!(
            strategy = %self.strategy_id,
            symbol = %request.symbol(),
            "Sending order to bridge"
        );
        let resp = self
            .http
            .post(format!("{}/orders", self.session_url))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        decode(resp).await
    }

    /// An already-gone session (404) counts as logged out.
    async fn disconnect(&mut self) -> Result<()> {
        let status = self
            .http
            .delete(&self.session_url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(strategy = %self.strategy_id, "Bridge session closed");
            return Ok(());
        }
        Err(Error::Venue(format!("logout refused: HTTP {status}")))
    }
}
