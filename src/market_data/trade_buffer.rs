use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::error;

use crate::market_data::dataset::{Column, Dataset, TimeIndex};
use crate::types::TradeTick;

pub const PRICE: &str = "price";
pub const SIZE: &str = "size";
pub const EXCHANGE: &str = "exchange";
pub const CONDITIONS: &str = "conditions";

// ---------------------------------------------------------------------------
// TradeBuffer -- per-symbol ring of received ticks
// ---------------------------------------------------------------------------

/// Arrival-ordered trade ticks for one symbol. With a capacity set, the
/// oldest tick is evicted once the ring is full; `None` grows without bound.
#[derive(Debug, Clone, Default)]
pub struct TradeBuffer {
    ticks: VecDeque<TradeTick>,
    capacity: Option<usize>,
}

impl TradeBuffer {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            ticks: VecDeque::with_capacity(capacity.unwrap_or(0).min(4096)),
            capacity,
        }
    }

    /// Append a tick. Returns `true` if an old tick was evicted to make room.
    pub fn push(&mut self, tick: TradeTick) -> bool {
        self.ticks.push_back(tick);
        match self.capacity {
            Some(cap) if self.ticks.len() > cap => {
                self.ticks.pop_front();
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TradeTick> {
        self.ticks.iter()
    }
}

// ---------------------------------------------------------------------------
// TickStore -- thread-safe map of buffers, readable while the stream runs
// ---------------------------------------------------------------------------

/// One [`TradeBuffer`] per subscribed symbol behind a single lock. The
/// receive loop writes; any number of readers take snapshots.
pub struct TickStore {
    buffers: RwLock<HashMap<String, TradeBuffer>>,
    capacity: Option<usize>,
}

impl TickStore {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Start a fresh, empty buffer for every symbol given, replacing any
    /// previous contents for those symbols. Other symbols are untouched.
    pub fn open(&self, symbols: &[String]) {
        let mut map = self.buffers.write();
        for sym in symbols {
            map.insert(sym.clone(), TradeBuffer::new(self.capacity));
        }
    }

    /// Append to the symbol's buffer. Returns `false` when the symbol has no
    /// buffer (not subscribed); the tick is discarded.
    pub fn push(&self, tick: TradeTick) -> bool {
        let mut map = self.buffers.write();
        match map.get_mut(&tick.symbol) {
            Some(buf) => {
                buf.push(tick);
                true
            }
            None => false,
        }
    }

    /// Copy of a symbol's ticks, oldest first. Empty for unknown symbols.
    pub fn snapshot(&self, symbol: &str) -> Vec<TradeTick> {
        self.buffers
            .read()
            .get(symbol)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.buffers.read().get(symbol).map_or(0, TradeBuffer::len)
    }

    /// Subscribed symbols with their buffered tick counts, sorted by symbol.
    pub fn sizes(&self) -> Vec<(String, usize)> {
        let map = self.buffers.read();
        let mut out: Vec<_> = map.iter().map(|(s, b)| (s.clone(), b.len())).collect();
        out.sort();
        out
    }
}

/// Tabular view of a tick sequence: timestamp index plus price, size,
/// exchange and comma-joined condition codes. Timestamps may repeat.
pub fn trades_to_dataset(ticks: &[TradeTick]) -> Dataset {
    let mut ds = Dataset::new(TimeIndex::Utc(ticks.iter().map(|t| t.timestamp).collect()));
    let columns = [
        (PRICE, Column::Float(ticks.iter().map(|t| Some(t.price)).collect())),
        (SIZE, Column::Float(ticks.iter().map(|t| Some(t.size as f64)).collect())),
        (
            EXCHANGE,
            Column::Float(ticks.iter().map(|t| Some(f64::from(t.exchange))).collect()),
        ),
        (
            CONDITIONS,
            Column::Text(
                ticks
                    .iter()
                    .map(|t| {
                        let codes: Vec<String> = t.conditions.iter().map(i32::to_string).collect();
                        Some(codes.join(","))
                    })
                    .collect(),
            ),
        ),
    ];
    for (name, column) in columns {
        // Every column is built from the same slice as the index.
        if let Err(e) = ds.insert_column(name, column) {
            error!(error = %e, "failed to build trade column");
        }
    }
    ds
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn tick(symbol: &str, price: f64) -> TradeTick {
        TradeTick {
            symbol: symbol.to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            price,
            size: 10,
            exchange: 4,
            conditions: Vec::new(),
            trade_id: None,
            tape: None,
        }
    }

    #[test]
    fn bounded_ring_evicts_oldest() {
        let mut buf = TradeBuffer::new(Some(2));
        assert!(!buf.push(tick("A", 1.0)));
        assert!(!buf.push(tick("A", 2.0)));
        assert!(buf.push(tick("A", 3.0)));
        let prices: Vec<f64> = buf.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![2.0, 3.0]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn unbounded_ring_keeps_everything() {
        let mut buf = TradeBuffer::new(None);
        for i in 0..10_000 {
            buf.push(tick("A", f64::from(i)));
        }
        assert_eq!(buf.len(), 10_000);
    }

    #[test]
    fn store_drops_unsubscribed_symbols() {
        let store = TickStore::new(Some(100));
        store.open(&["AAPL".to_string()]);
        assert!(store.push(tick("AAPL", 1.0)));
        assert!(!store.push(tick("TSLA", 1.0)));
        assert_eq!(store.len("AAPL"), 1);
        assert!(store.snapshot("TSLA").is_empty());
    }

    #[test]
    fn reopening_a_symbol_clears_only_that_buffer() {
        let store = TickStore::new(None);
        store.open(&["AAPL".to_string(), "MSFT".to_string()]);
        store.push(tick("AAPL", 1.0));
        store.push(tick("MSFT", 2.0));
        store.open(&["MSFT".to_string()]);
        assert_eq!(
            store.sizes(),
            vec![("AAPL".to_string(), 1), ("MSFT".to_string(), 0)]
        );
    }

    #[test]
    fn ticks_become_a_time_indexed_dataset() {
        let mut t = tick("MSFT", 320.5);
        t.conditions = vec![12, 37];
        let ds = trades_to_dataset(&[t, tick("MSFT", 321.0)]);
        assert_eq!(ds.shape(), (2, 4));
        assert_eq!(ds.value(PRICE, 1), Some(321.0));
        assert_eq!(ds.value(SIZE, 0), Some(10.0));
        match ds.column(CONDITIONS) {
            Some(Column::Text(v)) => assert_eq!(v[0].as_deref(), Some("12,37")),
            other => panic!("unexpected conditions column: {other:?}"),
        }
        assert!(trades_to_dataset(&[]).is_empty());
    }
}
