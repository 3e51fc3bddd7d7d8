// =============================================================================
// Historical Fetcher — drains paged aggregates into one ordered Dataset
// =============================================================================

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use crate::error::TransportError;
use crate::market_data::dataset::Dataset;
use crate::types::{AggregateRecord, AggregateRequest};

/// Anything that can answer an aggregates query.
///
/// Implementations own pagination: the returned vector must be the fully
/// drained result, never a single page.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    async fn list_aggs(
        &self,
        request: &AggregateRequest,
    ) -> Result<Vec<AggregateRecord>, TransportError>;
}

#[async_trait]
impl<T: AggregateSource + ?Sized> AggregateSource for std::sync::Arc<T> {
    async fn list_aggs(
        &self,
        request: &AggregateRequest,
    ) -> Result<Vec<AggregateRecord>, TransportError> {
        (**self).list_aggs(request).await
    }
}

pub struct HistoricalFetcher<S> {
    source: S,
}

impl<S: AggregateSource> HistoricalFetcher<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Fetch one symbol/range.
    ///
    /// * `Ok(Some(ds))` — rows found, ascending and unique by timestamp.
    /// * `Ok(None)` — valid query, no rows.
    /// * `Err(_)` — the provider failed; already logged here.
    #[instrument(skip(self, request), fields(symbol = %request.symbol))]
    pub async fn fetch(
        &self,
        request: &AggregateRequest,
    ) -> Result<Option<Dataset>, TransportError> {
        info!(
            start = %request.start,
            end = %request.end,
            interval = %request.interval_label(),
            adjusted = request.adjusted,
            "fetching aggregates"
        );

        if let Err(e) = validate_request(request) {
            error!(error = %e, "rejecting malformed aggregates request");
            return Err(e);
        }

        let records = match self.source.list_aggs(request).await {
            Ok(r) => r,
            Err(e) => {
                match &e {
                    TransportError::Auth { .. } => {
                        error!(error = %e, "provider rejected credentials; check the API key")
                    }
                    _ => error!(error = %e, "aggregates request failed"),
                }
                return Err(e);
            }
        };

        if records.is_empty() {
            warn!(
                start = %request.start,
                end = %request.end,
                "no aggregates found for range"
            );
            return Ok(None);
        }

        let dataset = records_to_dataset(records);
        info!(rows = dataset.len(), "aggregates fetched");
        Ok(Some(dataset))
    }
}

fn validate_request(request: &AggregateRequest) -> Result<(), TransportError> {
    if request.symbol.trim().is_empty() {
        return Err(TransportError::InvalidRequest("empty symbol".into()));
    }
    if request.multiplier == 0 {
        return Err(TransportError::InvalidRequest(
            "multiplier must be positive".into(),
        ));
    }
    if request.start > request.end {
        return Err(TransportError::InvalidRequest(format!(
            "start {} is after end {}",
            request.start, request.end
        )));
    }
    Ok(())
}

/// Sort ascending by timestamp (stable) and drop repeated timestamps, keeping
/// the first record seen. The source is asked for ascending order but is not
/// trusted to deliver it.
pub fn records_to_dataset(mut records: Vec<AggregateRecord>) -> Dataset {
    let in_order = records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp);
    if !in_order {
        warn!("provider returned aggregates out of order; sorting");
        records.sort_by_key(|r| r.timestamp);
    }

    let before = records.len();
    records.dedup_by_key(|r| r.timestamp);
    if records.len() < before {
        warn!(
            dropped = before - records.len(),
            "dropped aggregates with duplicate timestamps"
        );
    }

    Dataset::from_records(&records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::dataset::CLOSE;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use parking_lot::Mutex;

    struct ScriptedSource {
        result: Mutex<Option<Result<Vec<AggregateRecord>, TransportError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedSource {
        fn new(result: Result<Vec<AggregateRecord>, TransportError>) -> Self {
            Self {
                result: Mutex::new(Some(result)),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl AggregateSource for ScriptedSource {
        async fn list_aggs(
            &self,
            _request: &AggregateRequest,
        ) -> Result<Vec<AggregateRecord>, TransportError> {
            *self.calls.lock() += 1;
            self.result.lock().take().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn ms(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ts).unwrap()
    }

    fn bar(ts: i64, close: f64) -> AggregateRecord {
        AggregateRecord {
            timestamp: ms(ts),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100,
            vwap: Some(close),
            transactions: None,
        }
    }

    fn request() -> AggregateRequest {
        AggregateRequest::new(
            "AAPL",
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 10).unwrap(),
        )
    }

    #[tokio::test]
    async fn empty_result_is_not_found() {
        let fetcher = HistoricalFetcher::new(ScriptedSource::new(Ok(Vec::new())));
        let out = fetcher.fetch(&request()).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_returned_not_panicked() {
        let fetcher = HistoricalFetcher::new(ScriptedSource::new(Err(TransportError::Auth {
            status: 401,
            message: "bad key".into(),
        })));
        let err = fetcher.fetch(&request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn malformed_request_never_reaches_source() {
        let source = ScriptedSource::new(Ok(vec![bar(0, 1.0)]));
        let fetcher = HistoricalFetcher::new(source);
        let mut req = request();
        req.start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = fetcher.fetch(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert_eq!(*fetcher.source.calls.lock(), 0);
    }

    #[tokio::test]
    async fn unordered_source_is_sorted_and_deduplicated() {
        let day = 86_400_000;
        let records = vec![bar(3 * day, 3.0), bar(day, 1.0), bar(2 * day, 2.0), bar(day, 9.0)];
        let fetcher = HistoricalFetcher::new(ScriptedSource::new(Ok(records)));
        let ds = fetcher.fetch(&request()).await.unwrap().unwrap();

        let index = ds.utc_index().unwrap();
        assert_eq!(index, &[ms(day), ms(2 * day), ms(3 * day)]);
        assert!(index.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ds.value(CLOSE, 0), Some(1.0));
    }

    #[test]
    fn transactions_default_to_absent() {
        let ds = records_to_dataset(vec![bar(0, 5.0)]);
        assert_eq!(ds.value("transactions", 0), None);
        assert_eq!(ds.value("vwap", 0), Some(5.0));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn output_is_strictly_ascending(stamps in proptest::collection::vec(0i64..10_000_000, 1..60)) {
                let records: Vec<_> = stamps.iter().map(|&t| bar(t, 1.0)).collect();
                let ds = records_to_dataset(records);
                let index = ds.utc_index().unwrap();
                prop_assert!(!index.is_empty());
                prop_assert!(index.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
