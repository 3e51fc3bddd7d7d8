// =============================================================================
// Polygon REST Client — aggregates (bars) endpoint with pagination
// =============================================================================
//
// SECURITY: The API key is never logged or serialized. It travels as the
// `apiKey` query parameter, which Polygon also requires on every `next_url`
// page link (the links it returns omit it).
// =============================================================================

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::TransportError;
use crate::market_data::fetcher::AggregateSource;
use crate::types::{AggregateRecord, AggregateRequest};

pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";
/// Largest page Polygon serves for aggregates.
pub const MAX_PAGE_LIMIT: u32 = 50_000;

/// Polygon market data REST client.
#[derive(Clone)]
pub struct PolygonClient {
    api_key: String,
    base_url: String,
    page_limit: u32,
    client: reqwest::Client,
}

impl PolygonClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// # Arguments
    /// * `base_url`   — scheme + host, no trailing slash required.
    /// * `page_limit` — rows per page, clamped to `1..=50_000`.
    /// * `timeout`    — per-request timeout.
    pub fn with_options(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        page_limit: u32,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "PolygonClient initialised");

        Ok(Self {
            api_key: api_key.into(),
            base_url,
            page_limit: page_limit.clamp(1, MAX_PAGE_LIMIT),
            client,
        })
    }

    /// First-page URL, without query parameters.
    pub fn aggregates_url(&self, request: &AggregateRequest) -> String {
        format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            request.symbol,
            request.multiplier,
            request.timespan,
            request.start.format("%Y-%m-%d"),
            request.end.format("%Y-%m-%d"),
        )
    }

    // -------------------------------------------------------------------------
    // Aggregates
    // -------------------------------------------------------------------------

    /// GET /v2/aggs/ticker/{sym}/range/{mult}/{unit}/{from}/{to}, following
    /// `next_url` until the result set is drained.
    #[instrument(skip(self, request), name = "polygon::get_aggregates", fields(symbol = %request.symbol))]
    pub async fn get_aggregates(
        &self,
        request: &AggregateRequest,
    ) -> Result<Vec<AggregateRecord>, TransportError> {
        let first = Url::parse_with_params(
            &self.aggregates_url(request),
            &[
                ("adjusted", request.adjusted.to_string()),
                ("sort", "asc".to_string()),
                ("limit", self.page_limit.to_string()),
                ("apiKey", self.api_key.clone()),
            ],
        )
        .map_err(|e| TransportError::InvalidRequest(format!("bad aggregates URL: {e}")))?;

        drain_pages(&self.client, &self.api_key, first).await
    }
}

// -----------------------------------------------------------------------------
// Pagination
// -----------------------------------------------------------------------------

/// One GET round trip, returning the status code and raw body.
#[async_trait]
trait PageTransport: Send + Sync {
    async fn get_page(&self, url: Url) -> Result<(u16, String), TransportError>;
}

#[async_trait]
impl PageTransport for reqwest::Client {
    async fn get_page(&self, url: Url) -> Result<(u16, String), TransportError> {
        let resp = self.get(url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok((status, body))
    }
}

/// Fetch `first`, then every `next_url` with the key re-appended, until a
/// page carries no link. A link seen twice stops the walk with a warning.
async fn drain_pages<T: PageTransport + ?Sized>(
    transport: &T,
    api_key: &str,
    first: Url,
) -> Result<Vec<AggregateRecord>, TransportError> {
    let (status, body) = transport.get_page(first).await?;
    let mut page = parse_page(status, &body)?;
    let mut records = page.take_records()?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut pages = 1usize;

    while let Some(next) = page.next_url.take() {
        if !seen.insert(next.clone()) {
            warn!(pages, "provider repeated a page link; stopping pagination");
            break;
        }
        let mut url = Url::parse(&next)
            .map_err(|e| TransportError::Decode(format!("unparseable next_url: {e}")))?;
        url.query_pairs_mut().append_pair("apiKey", api_key);

        let (status, body) = transport.get_page(url).await?;
        page = parse_page(status, &body)?;
        records.extend(page.take_records()?);
        pages += 1;
    }

    debug!(pages, count = records.len(), "aggregates fetched");
    Ok(records)
}

#[async_trait]
impl AggregateSource for PolygonClient {
    async fn list_aggs(
        &self,
        request: &AggregateRequest,
    ) -> Result<Vec<AggregateRecord>, TransportError> {
        self.get_aggregates(request).await
    }
}

impl std::fmt::Debug for PolygonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolygonClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Wire format
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AggsPage {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    results: Option<Vec<WireAgg>>,
    #[serde(default)]
    next_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl AggsPage {
    fn take_records(&mut self) -> Result<Vec<AggregateRecord>, TransportError> {
        self.results
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(WireAgg::into_record)
            .collect()
    }
}

/// One bar as Polygon sends it. `v` can arrive fractional on some feeds.
#[derive(Debug, Deserialize)]
struct WireAgg {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    #[serde(default)]
    vw: Option<f64>,
    #[serde(default)]
    n: Option<u64>,
}

impl WireAgg {
    fn into_record(self) -> Result<AggregateRecord, TransportError> {
        let timestamp = Utc
            .timestamp_millis_opt(self.t)
            .single()
            .ok_or_else(|| TransportError::Decode(format!("bar timestamp {} out of range", self.t)))?;
        Ok(AggregateRecord {
            timestamp,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v.round().max(0.0) as u64,
            vwap: self.vw,
            transactions: self.n,
        })
    }
}

/// Best human-readable reason from an error body, falling back to the raw
/// text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<AggsPage>(body)
        .ok()
        .and_then(|p| p.error.or(p.message))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn parse_page(status: u16, body: &str) -> Result<AggsPage, TransportError> {
    if status == 401 || status == 403 {
        return Err(TransportError::Auth {
            status,
            message: error_message(body),
        });
    }
    if !(200..300).contains(&status) {
        return Err(TransportError::BadResponse {
            status,
            message: error_message(body),
        });
    }

    let page: AggsPage =
        serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))?;

    match page.status.as_deref() {
        Some("NOT_AUTHORIZED") => Err(TransportError::Auth {
            status,
            message: page.message.or(page.error).unwrap_or_default(),
        }),
        Some("ERROR") => Err(TransportError::BadResponse {
            status,
            message: page.error.or(page.message).unwrap_or_default(),
        }),
        _ => Ok(page),
    }
}
