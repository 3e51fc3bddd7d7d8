// =============================================================================
// Streaming Handler — trade subscription, decoding, per-symbol buffering
// =============================================================================
//
// Lifecycle: Disconnected -> Connected -> Subscribed -> Streaming -> Closed.
//
// The receive loop is the only writer of the tick buffers; readers go through
// the shared `TickStore` and may observe in-progress state. Callbacks run
// inline in the loop, so a slow callback delays the next message.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::market_data::dataset::Dataset;
use crate::market_data::trade_buffer::{trades_to_dataset, TickStore};
use crate::types::TradeTick;

/// Event tag carried by trade messages.
pub const TRADE_EVENT: &str = "T";

/// Invoked once per buffered tick, inside the receive loop.
pub type TradeCallback = Arc<dyn Fn(&TradeTick) -> anyhow::Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Streaming capability
// ---------------------------------------------------------------------------

/// Opens authenticated sessions with the trade feed.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, StreamError>;
}

/// One live session. `recv` yields raw text frames; `Ok(None)` means the
/// server ended the session.
#[async_trait]
pub trait StreamSession: Send {
    async fn subscribe(&mut self, channels: &[String]) -> Result<(), StreamError>;
    async fn recv(&mut self) -> Result<Option<String>, StreamError>;
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Trade channel name for a symbol.
pub fn trade_channel(symbol: &str) -> String {
    format!("{TRADE_EVENT}.{symbol}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connected,
    Subscribed,
    Streaming,
    Closed,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireTrade {
    sym: String,
    t: i64,
    p: f64,
    s: u64,
    x: i32,
    #[serde(default)]
    c: Option<Vec<i32>>,
    #[serde(default)]
    i: Option<String>,
    #[serde(default)]
    z: Option<u8>,
}

impl WireTrade {
    fn into_tick(self) -> Result<TradeTick, StreamError> {
        let timestamp = Utc
            .timestamp_millis_opt(self.t)
            .single()
            .ok_or_else(|| StreamError::Decode(format!("timestamp {} out of range", self.t)))?;
        Ok(TradeTick {
            symbol: self.sym,
            timestamp,
            price: self.p,
            size: self.s,
            exchange: self.x,
            conditions: self.c.unwrap_or_default(),
            trade_id: self.i,
            tape: self.z,
        })
    }
}

// ---------------------------------------------------------------------------
// StreamingHandler
// ---------------------------------------------------------------------------

pub struct StreamingHandler<C> {
    connector: C,
    session: Option<Box<dyn StreamSession>>,
    state: StreamState,
    store: Arc<TickStore>,
    callbacks: HashMap<String, TradeCallback>,
    subscribed: BTreeSet<String>,
}

impl<C: StreamConnector> StreamingHandler<C> {
    /// `buffer_capacity` bounds each symbol's ring; `None` is unbounded.
    pub fn new(connector: C, buffer_capacity: Option<usize>) -> Self {
        Self {
            connector,
            session: None,
            state: StreamState::Disconnected,
            store: Arc::new(TickStore::new(buffer_capacity)),
            callbacks: HashMap::new(),
            subscribed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Shared read handle on the tick buffers, usable while streaming.
    pub fn reader(&self) -> Arc<TickStore> {
        Arc::clone(&self.store)
    }

    /// Open a session. No-op if one is already open; allowed again after
    /// `close()`.
    pub async fn connect(&mut self) -> Result<(), StreamError> {
        if self.session.is_some() {
            return Ok(());
        }
        match self.connector.connect().await {
            Ok(session) => {
                self.session = Some(session);
                self.state = StreamState::Connected;
                info!("streaming session connected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to open streaming session");
                Err(e)
            }
        }
    }

    /// Subscribe to trades for `symbols`, connecting first if needed. Each
    /// symbol gets a fresh empty buffer. `Some(callback)` replaces any
    /// earlier callback for the symbol; `None` keeps it.
    pub async fn subscribe(
        &mut self,
        symbols: &[String],
        callback: Option<TradeCallback>,
    ) -> Result<(), StreamError> {
        if symbols.is_empty() {
            warn!("subscribe called with no symbols");
            return Ok(());
        }
        self.connect().await?;
        let Some(session) = self.session.as_mut() else {
            return Err(StreamError::Closed);
        };

        let channels: Vec<String> = symbols.iter().map(|s| trade_channel(s)).collect();
        if let Err(e) = session.subscribe(&channels).await {
            error!(error = %e, channels = %channels.join(","), "failed to subscribe");
            return Err(e);
        }

        self.store.open(symbols);
        for sym in symbols {
            if let Some(cb) = &callback {
                self.callbacks.insert(sym.clone(), Arc::clone(cb));
            }
            self.subscribed.insert(sym.clone());
            info!(symbol = %sym, "subscribed to trades");
        }
        self.state = StreamState::Subscribed;
        Ok(())
    }

    /// Receive and route messages until the session ends (`Ok`) or a receive
    /// fails (`Err`). Never reconnects.
    pub async fn start_streaming(&mut self) -> Result<(), StreamError> {
        if self.subscribed.is_empty() {
            return Err(StreamError::NotSubscribed);
        }
        let Self {
            session,
            state,
            store,
            callbacks,
            ..
        } = self;
        let Some(session) = session.as_mut() else {
            return Err(StreamError::Closed);
        };

        *state = StreamState::Streaming;
        info!("streaming started");

        let mut routed: u64 = 0;
        loop {
            match session.recv().await {
                Ok(Some(text)) => {
                    routed += route_message(store.as_ref(), callbacks, &text) as u64;
                }
                Ok(None) => {
                    warn!(ticks = routed, "streaming session ended by server");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, ticks = routed, "streaming receive failed");
                    return Err(e);
                }
            }
        }
    }

    /// Decode one raw frame and route every trade event in it. Returns the
    /// number of ticks buffered. Never fails: bad input is logged and
    /// skipped.
    pub fn handle_message(&self, text: &str) -> usize {
        route_message(&self.store, &self.callbacks, text)
    }

    /// Release the session and forget subscriptions. Safe from any state and
    /// idempotent. Buffered ticks remain readable.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.close().await {
                Ok(()) => info!("streaming session closed"),
                Err(e) => warn!(error = %e, "error while closing streaming session"),
            }
        }
        self.callbacks.clear();
        self.subscribed.clear();
        self.state = StreamState::Closed;
    }

    /// Ticks buffered for `symbol`, oldest first; empty for unknown symbols.
    pub fn get_buffer(&self, symbol: &str) -> Vec<TradeTick> {
        self.store.snapshot(symbol)
    }

    /// Same as [`get_buffer`](Self::get_buffer), as a time-indexed table.
    pub fn get_buffer_dataset(&self, symbol: &str) -> Dataset {
        trades_to_dataset(&self.store.snapshot(symbol))
    }
}

fn route_message(
    store: &TickStore,
    callbacks: &HashMap<String, TradeCallback>,
    text: &str,
) -> usize {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping undecodable stream message");
            return 0;
        }
    };

    let events = match value {
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        other => {
            warn!(message = %other, "dropping unexpected stream message");
            return 0;
        }
    };

    let mut buffered = 0;
    for event in events {
        match event.get("ev").and_then(|v| v.as_str()) {
            Some(TRADE_EVENT) => {}
            Some("status") => {
                debug!(status = ?event.get("status"), message = ?event.get("message"), "stream status");
                continue;
            }
            _ => continue,
        }

        let tick = match serde_json::from_value::<WireTrade>(event)
            .map_err(|e| StreamError::Decode(e.to_string()))
            .and_then(WireTrade::into_tick)
        {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "skipping malformed trade event");
                continue;
            }
        };

        if !store.push(tick.clone()) {
            debug!(symbol = %tick.symbol, "trade for unsubscribed symbol dropped");
            continue;
        }
        buffered += 1;

        if let Some(cb) = callbacks.get(&tick.symbol) {
            if let Err(e) = cb(&tick) {
                warn!(symbol = %tick.symbol, error = %e, "trade callback failed");
            }
        }
    }
    buffered
}
