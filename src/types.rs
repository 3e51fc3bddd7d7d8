// =============================================================================
// Shared types used across the equity feed pipeline
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Sampling unit for aggregate bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timespan {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Default for Timespan {
    fn default() -> Self {
        Self::Day
    }
}

impl Timespan {
    /// Path segment the aggregates endpoint expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }
}

impl std::fmt::Display for Timespan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timespan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown timespan '{other}'")),
        }
    }
}

/// Parameters of one historical aggregates query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub multiplier: u32,
    pub timespan: Timespan,
    pub adjusted: bool,
}

impl AggregateRequest {
    pub fn new(symbol: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            start,
            end,
            multiplier: 1,
            timespan: Timespan::Day,
            adjusted: true,
        }
    }

    pub fn with_interval(mut self, multiplier: u32, timespan: Timespan) -> Self {
        self.multiplier = multiplier;
        self.timespan = timespan;
        self
    }

    pub fn with_adjusted(mut self, adjusted: bool) -> Self {
        self.adjusted = adjusted;
        self
    }

    /// Short label such as `1day` used in output file names.
    pub fn interval_label(&self) -> String {
        format!("{}{}", self.multiplier, self.timespan)
    }
}

/// One OHLCV bucket as returned by the aggregates endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub vwap: Option<f64>,
    pub transactions: Option<u64>,
}

/// One trade print received from the streaming feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: u64,
    pub exchange: i32,
    pub conditions: Vec<i32>,
    /// Exchange-assigned trade id, when the feed supplies one.
    pub trade_id: Option<String>,
    /// Consolidated tape (1 = NYSE, 2 = AMEX, 3 = Nasdaq).
    pub tape: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan_round_trips_through_text() {
        for ts in [
            Timespan::Minute,
            Timespan::Hour,
            Timespan::Day,
            Timespan::Week,
            Timespan::Month,
            Timespan::Quarter,
            Timespan::Year,
        ] {
            assert_eq!(ts.as_str().parse::<Timespan>().unwrap(), ts);
        }
        assert!("fortnight".parse::<Timespan>().is_err());
    }

    #[test]
    fn timespan_serde_is_lowercase() {
        let json = serde_json::to_string(&Timespan::Quarter).unwrap();
        assert_eq!(json, "\"quarter\"");
        let back: Timespan = serde_json::from_str("\"minute\"").unwrap();
        assert_eq!(back, Timespan::Minute);
    }

    #[test]
    fn interval_label_combines_multiplier_and_unit() {
        let req = AggregateRequest::new(
            "AAPL",
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 10).unwrap(),
        )
        .with_interval(5, Timespan::Minute);
        assert_eq!(req.interval_label(), "5minute");
        assert!(req.adjusted);
    }
}
