// =============================================================================
// Pipeline Orchestrator — fetch -> clean -> save per symbol, or live trades
// =============================================================================
//
// Historical mode processes one symbol at a time and always attempts every
// symbol: a failure is recorded in the batch report and the loop moves on.
//
// Real-time mode owns the streaming lifecycle: subscribe, stream until the
// session ends or shutdown is requested, then close and report buffer sizes.
// =============================================================================

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::StreamError;
use crate::market_data::fetcher::{AggregateSource, HistoricalFetcher};
use crate::market_data::persistence;
use crate::market_data::preprocess::{CleanReport, Preprocessor};
use crate::market_data::stream::{StreamConnector, StreamingHandler, TradeCallback};
use crate::types::{AggregateRequest, TradeTick};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    /// Written to `path`. `verified` is `None` when verification is off.
    Saved {
        path: PathBuf,
        rows: usize,
        verified: Option<bool>,
    },
    /// Valid query, no rows.
    NotFound,
    /// The provider call failed; the message is the transport error.
    FetchFailed(String),
    /// Rows were fetched but none survived cleaning.
    Empty,
    SaveFailed,
}

impl SymbolOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolReport {
    pub symbol: String,
    pub outcome: SymbolOutcome,
    pub clean: Option<CleanReport>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub symbols: Vec<SymbolReport>,
}

impl BatchReport {
    pub fn saved(&self) -> usize {
        self.symbols.iter().filter(|r| r.outcome.is_saved()).count()
    }

    pub fn failed(&self) -> usize {
        self.symbols.len() - self.saved()
    }

    pub fn outcome(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.symbols
            .iter()
            .find(|r| r.symbol == symbol)
            .map(|r| &r.outcome)
    }
}

/// `AAPL_1day_adjusted_processed.csv`
pub fn output_filename(request: &AggregateRequest) -> String {
    format!(
        "{}_{}_{}_processed.csv",
        request.symbol,
        request.interval_label(),
        if request.adjusted { "adjusted" } else { "unadjusted" }
    )
}

// ---------------------------------------------------------------------------
// Historical mode
// ---------------------------------------------------------------------------

pub struct HistoricalPipeline<S> {
    fetcher: HistoricalFetcher<S>,
    preprocessor: Preprocessor,
    data_dir: PathBuf,
    verify_after_save: bool,
}

impl<S: AggregateSource> HistoricalPipeline<S> {
    pub fn new(
        source: S,
        preprocessor: Preprocessor,
        data_dir: impl Into<PathBuf>,
        verify_after_save: bool,
    ) -> Self {
        Self {
            fetcher: HistoricalFetcher::new(source),
            preprocessor,
            data_dir: data_dir.into(),
            verify_after_save,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Run every request in order. Never stops early.
    pub async fn run_batch(&self, requests: &[AggregateRequest]) -> BatchReport {
        let mut report = BatchReport::default();
        for request in requests {
            report.symbols.push(self.run_symbol(request).await);
        }
        info!(
            total = report.symbols.len(),
            saved = report.saved(),
            failed = report.failed(),
            "all pipelines completed"
        );
        report
    }

    pub async fn run_symbol(&self, request: &AggregateRequest) -> SymbolReport {
        let span = info_span!("pipeline", symbol = %request.symbol);
        async {
            info!("starting pipeline");
            let (outcome, clean) = self.process(request).await;
            match &outcome {
                SymbolOutcome::Saved { path, rows, .. } => {
                    info!(path = %path.display(), rows, "pipeline finished")
                }
                other => warn!(outcome = ?other, "pipeline terminated without output"),
            }
            SymbolReport {
                symbol: request.symbol.clone(),
                outcome,
                clean,
            }
        }
        .instrument(span)
        .await
    }

    async fn process(&self, request: &AggregateRequest) -> (SymbolOutcome, Option<CleanReport>) {
        let raw = match self.fetcher.fetch(request).await {
            Ok(Some(ds)) => ds,
            Ok(None) => return (SymbolOutcome::NotFound, None),
            Err(e) => return (SymbolOutcome::FetchFailed(e.to_string()), None),
        };
        info!(rows = raw.len(), "acquired raw data");

        let Some((processed, clean)) = self.preprocessor.clean_with_report(&raw, &request.symbol)
        else {
            return (SymbolOutcome::Empty, None);
        };
        if processed.is_empty() {
            error!("no rows left after preprocessing");
            return (SymbolOutcome::Empty, Some(clean));
        }
        let (rows, cols) = processed.shape();
        info!(rows, cols, "preprocessed data");

        let filename = output_filename(request);
        if !persistence::save(&processed, &filename, &self.data_dir) {
            return (SymbolOutcome::SaveFailed, Some(clean));
        }

        let verified = self.verify_after_save.then(|| {
            match persistence::load(&filename, &self.data_dir) {
                Some(loaded) if loaded.shape() == processed.shape() => {
                    info!(shape = ?loaded.shape(), "reloaded file matches processed shape");
                    true
                }
                Some(loaded) => {
                    warn!(
                        processed = ?processed.shape(),
                        loaded = ?loaded.shape(),
                        "shape mismatch after reload"
                    );
                    false
                }
                None => {
                    warn!("could not load saved file back for verification");
                    false
                }
            }
        });

        (
            SymbolOutcome::Saved {
                path: self.data_dir.join(filename),
                rows,
                verified,
            },
            Some(clean),
        )
    }
}

// ---------------------------------------------------------------------------
// Real-time mode
// ---------------------------------------------------------------------------

fn log_tick(tick: &TradeTick) -> anyhow::Result<()> {
    debug!(
        symbol = %tick.symbol,
        price = tick.price,
        size = tick.size,
        exchange = tick.exchange,
        ts = %tick.timestamp,
        "trade"
    );
    Ok(())
}

/// Subscribe `symbols`, stream until the session ends or `shutdown`
/// resolves, then close. The session is closed on every path.
pub async fn run_realtime<C, F>(
    handler: &mut StreamingHandler<C>,
    symbols: &[String],
    shutdown: F,
) -> Result<(), StreamError>
where
    C: StreamConnector,
    F: Future<Output = ()>,
{
    let callback: TradeCallback = Arc::new(log_tick);

    let result = match handler.subscribe(symbols, Some(callback)).await {
        Ok(()) => {
            tokio::select! {
                res = handler.start_streaming() => res,
                _ = shutdown => {
                    info!("shutdown requested; stopping stream");
                    Ok(())
                }
            }
        }
        Err(e) => Err(e),
    };

    handler.close().await;
    for (symbol, ticks) in handler.reader().sizes() {
        info!(symbol = %symbol, ticks, "buffered trades at shutdown");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::market_data::stream::{StreamSession, StreamState};
    use crate::types::AggregateRecord;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    // --- historical fakes -----------------------------------------------------

    enum Reply {
        Bars(Vec<AggregateRecord>),
        Fail,
    }

    struct FakeSource(HashMap<String, Reply>);

    #[async_trait]
    impl AggregateSource for FakeSource {
        async fn list_aggs(
            &self,
            request: &AggregateRequest,
        ) -> Result<Vec<AggregateRecord>, TransportError> {
            match self.0.get(&request.symbol) {
                Some(Reply::Bars(b)) => Ok(b.clone()),
                Some(Reply::Fail) => Err(TransportError::Connection("connection reset".into())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn bars(n: u32, transactions: Option<u64>) -> Vec<AggregateRecord> {
        (0..n)
            .map(|i| AggregateRecord {
                timestamp: Utc.with_ymd_and_hms(2023, 1, 3 + i, 5, 0, 0).unwrap(),
                open: 100.0 + f64::from(i),
                high: 101.0 + f64::from(i),
                low: 99.0 + f64::from(i),
                close: 100.5 + f64::from(i),
                volume: 1_000,
                vwap: Some(100.25),
                transactions,
            })
            .collect()
    }

    fn request(symbol: &str) -> AggregateRequest {
        AggregateRequest::new(
            symbol,
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 10).unwrap(),
        )
    }

    fn pipeline(dir: &Path) -> HistoricalPipeline<FakeSource> {
        let mut replies = HashMap::new();
        replies.insert("AAPL".to_string(), Reply::Bars(bars(4, Some(50))));
        replies.insert("SPARSE".to_string(), Reply::Bars(bars(3, None)));
        replies.insert("DOWN".to_string(), Reply::Fail);
        HistoricalPipeline::new(FakeSource(replies), Preprocessor::default(), dir, true)
    }

    #[test]
    fn filename_encodes_interval_and_adjustment() {
        assert_eq!(output_filename(&request("AAPL")), "AAPL_1day_adjusted_processed.csv");
        let req = request("MSFT")
            .with_interval(5, crate::types::Timespan::Minute)
            .with_adjusted(false);
        assert_eq!(output_filename(&req), "MSFT_5minute_unadjusted_processed.csv");
    }

    #[tokio::test]
    async fn batch_attempts_every_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let requests: Vec<_> = ["DOWN", "EMPTY", "SPARSE", "AAPL"]
            .iter()
            .map(|s| request(s))
            .collect();

        let report = p.run_batch(&requests).await;
        assert_eq!(report.symbols.len(), 4);
        assert_eq!(report.saved(), 1);
        assert_eq!(report.failed(), 3);

        assert!(matches!(report.outcome("DOWN"), Some(SymbolOutcome::FetchFailed(_))));
        assert_eq!(report.outcome("EMPTY"), Some(&SymbolOutcome::NotFound));
        // An entirely absent column leaves no complete rows.
        assert_eq!(report.outcome("SPARSE"), Some(&SymbolOutcome::Empty));

        let expected = dir.path().join("AAPL_1day_adjusted_processed.csv");
        assert_eq!(
            report.outcome("AAPL"),
            Some(&SymbolOutcome::Saved {
                path: expected.clone(),
                rows: 4,
                verified: Some(true),
            })
        );
        assert!(expected.exists());
        assert!(!dir.path().join("EMPTY_1day_adjusted_processed.csv").exists());
    }

    #[tokio::test]
    async fn saved_file_reloads_as_processed_data() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let report = p.run_symbol(&request("AAPL")).await;
        assert!(report.outcome.is_saved());
        assert_eq!(report.clean.as_ref().map(|c| c.output_rows), Some(4));

        let loaded = persistence::load("AAPL_1day_adjusted_processed.csv", dir.path()).unwrap();
        assert_eq!(loaded.shape(), (4, 8));
        assert_eq!(loaded.value("daily_return", 0), Some(0.0));
    }

    #[tokio::test]
    async fn unwritable_directory_is_save_failed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();
        let p = pipeline(&blocker.join("out"));
        let report = p.run_symbol(&request("AAPL")).await;
        assert_eq!(report.outcome, SymbolOutcome::SaveFailed);
    }

    // --- streaming fakes ------------------------------------------------------

    #[derive(Clone, Default)]
    struct Feed {
        frames: Arc<Mutex<VecDeque<String>>>,
        closes: Arc<Mutex<usize>>,
        hang: bool,
    }

    struct FeedSession(Feed);

    #[async_trait]
    impl StreamConnector for Feed {
        async fn connect(&self) -> Result<Box<dyn StreamSession>, StreamError> {
            Ok(Box::new(FeedSession(self.clone())))
        }
    }

    #[async_trait]
    impl StreamSession for FeedSession {
        async fn subscribe(&mut self, _channels: &[String]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, StreamError> {
            let next = self.0.frames.lock().pop_front();
            match next {
                Some(f) => Ok(Some(f)),
                None if self.0.hang => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            *self.0.closes.lock() += 1;
            Ok(())
        }
    }

    fn trade(sym: &str, t: i64) -> String {
        format!(r#"[{{"ev":"T","sym":"{sym}","t":{t},"p":10.5,"s":5,"x":2,"c":[14]}}]"#)
    }

    #[tokio::test]
    async fn realtime_streams_until_session_ends_then_closes() {
        let feed = Feed::default();
        feed.frames.lock().extend([trade("AAPL", 1), trade("MSFT", 2), trade("AAPL", 3)]);
        let mut handler = StreamingHandler::new(feed.clone(), Some(10));

        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        run_realtime(&mut handler, &symbols, std::future::pending::<()>())
            .await
            .unwrap();

        assert_eq!(handler.state(), StreamState::Closed);
        assert_eq!(*feed.closes.lock(), 1);
        assert_eq!(handler.get_buffer("AAPL").len(), 2);
        assert_eq!(handler.get_buffer("MSFT")[0].conditions, vec![14]);
    }

    #[tokio::test]
    async fn realtime_shutdown_signal_closes_session() {
        let feed = Feed {
            hang: true,
            ..Feed::default()
        };
        feed.frames.lock().push_back(trade("AAPL", 1));
        let mut handler = StreamingHandler::new(feed.clone(), None);

        let symbols = vec!["AAPL".to_string()];
        let shutdown = tokio::time::sleep(Duration::from_millis(20));
        run_realtime(&mut handler, &symbols, shutdown).await.unwrap();

        assert_eq!(handler.state(), StreamState::Closed);
        assert_eq!(*feed.closes.lock(), 1);
        assert_eq!(handler.get_buffer("AAPL").len(), 1);
    }
}
