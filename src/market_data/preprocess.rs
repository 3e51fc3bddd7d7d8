// =============================================================================
// Preprocessor — normalizes a raw bar table into the canonical shape
// =============================================================================
//
// Steps, in order (each idempotent when re-applied):
//   1. Index to UTC, then ascending and unique.
//   2. Gaps: forward-fill, backward-fill, drop rows still incomplete.
//   3. open/high/low/close/volume coerced to numbers per CoercionPolicy.
//   4. daily_return = close[i] / close[i-1] - 1, with row 0 = 0.
//   5. |daily_return| above the threshold is logged. Rows are not touched.
//
// Every repair is recorded in the returned CleanReport as well as logged.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::ValidationIssue;
use crate::market_data::dataset::{
    Column, Dataset, TimezoneAction, CLOSE, DAILY_RETURN, PRICE_VOLUME_COLUMNS,
};

/// Default absolute daily return above which a row is flagged.
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 0.15;

/// What to do when a price/volume column holds values that are not numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoercionPolicy {
    /// Replace the whole column with zeros. Keeps every row, but a zeroed
    /// close produces -100% returns downstream.
    #[default]
    ZeroColumn,
    /// Drop only the rows whose cell does not parse.
    DropRows,
}

/// Everything `clean` did to one dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanReport {
    pub input_rows: usize,
    pub output_rows: usize,
    pub timezone: TimezoneAction,
    pub reordered: bool,
    pub duplicates_dropped: usize,
    pub missing_before: Vec<(String, usize)>,
    pub rows_dropped_missing: usize,
    pub rows_dropped_coercion: usize,
    pub issues: Vec<ValidationIssue>,
    pub outliers: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    policy: CoercionPolicy,
    outlier_threshold: f64,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(CoercionPolicy::default(), DEFAULT_OUTLIER_THRESHOLD)
    }
}

impl Preprocessor {
    pub fn new(policy: CoercionPolicy, outlier_threshold: f64) -> Self {
        Self {
            policy,
            outlier_threshold,
        }
    }

    /// Clean `dataset`; `None` when there is nothing to clean.
    pub fn clean(&self, dataset: &Dataset, label: &str) -> Option<Dataset> {
        self.clean_with_report(dataset, label).map(|(ds, _)| ds)
    }

    pub fn clean_with_report(&self, dataset: &Dataset, label: &str) -> Option<(Dataset, CleanReport)> {
        if dataset.is_empty() {
            warn!(symbol = %label, "input dataset is empty; skipping preprocessing");
            return None;
        }

        info!(symbol = %label, rows = dataset.len(), "starting preprocessing");
        let mut ds = dataset.clone();
        let mut report = CleanReport {
            input_rows: ds.len(),
            ..CleanReport::default()
        };

        self.normalize_index(&mut ds, label, &mut report);
        self.fill_missing(&mut ds, label, &mut report);
        ds = self.coerce_numeric(ds, label, &mut report);
        self.add_daily_return(&mut ds, label);
        self.flag_outliers(&ds, label, &mut report);

        report.output_rows = ds.len();
        info!(
            symbol = %label,
            rows = ds.len(),
            columns = ds.shape().1,
            "preprocessing completed"
        );
        Some((ds, report))
    }

    fn normalize_index(&self, ds: &mut Dataset, label: &str, report: &mut CleanReport) {
        report.timezone = ds.normalize_index_to_utc();
        match report.timezone {
            TimezoneAction::Localized => {
                warn!(symbol = %label, "index is timezone-naive; assuming UTC")
            }
            TimezoneAction::Converted => {
                info!(symbol = %label, "index carries a non-UTC offset; converting to UTC")
            }
            TimezoneAction::AlreadyUtc => {}
        }

        let (reordered, dropped) = ds.sort_and_dedup();
        if reordered {
            warn!(symbol = %label, "index was out of order; sorted ascending");
        }
        if dropped > 0 {
            warn!(symbol = %label, dropped, "dropped rows with duplicate timestamps");
        }
        report.reordered = reordered;
        report.duplicates_dropped = dropped;
    }

    fn fill_missing(&self, ds: &mut Dataset, label: &str, report: &mut CleanReport) {
        report.missing_before = ds.missing_counts();
        if report.missing_before.is_empty() {
            debug!(symbol = %label, "no missing values");
            return;
        }

        info!(symbol = %label, missing = ?report.missing_before, "missing values before filling");
        for (_, column) in ds.columns_mut() {
            column.forward_fill();
            column.backward_fill();
        }

        let remaining: usize = ds.missing_counts().iter().map(|(_, n)| n).sum();
        if remaining == 0 {
            info!(symbol = %label, "missing values filled");
            return;
        }

        warn!(
            symbol = %label,
            remaining,
            "values still missing after forward and backward fill; dropping incomplete rows"
        );
        let keep: Vec<usize> = (0..ds.len()).filter(|&i| !ds.row_has_missing(i)).collect();
        report.rows_dropped_missing = ds.len() - keep.len();
        *ds = ds.take_rows(&keep);
    }

    fn coerce_numeric(&self, mut ds: Dataset, label: &str, report: &mut CleanReport) -> Dataset {
        let mut bad_rows = vec![false; ds.len()];
        let mut replacements: Vec<(&str, Column)> = Vec::new();

        for name in PRICE_VOLUME_COLUMNS {
            let Some(Column::Text(cells)) = ds.column(name) else {
                continue;
            };

            let parsed: Vec<Option<f64>> = cells
                .iter()
                .map(|c| c.as_deref().and_then(|s| s.trim().parse::<f64>().ok()))
                .collect();
            let failures: Vec<usize> = cells
                .iter()
                .zip(&parsed)
                .enumerate()
                .filter(|(_, (raw, num))| raw.is_some() && num.is_none())
                .map(|(i, _)| i)
                .collect();

            if failures.is_empty() {
                info!(symbol = %label, column = name, "converted column to numeric");
                replacements.push((name, Column::Float(parsed)));
                continue;
            }

            error!(
                symbol = %label,
                column = name,
                bad_cells = failures.len(),
                "could not convert column to numeric"
            );
            let issue = match self.policy {
                CoercionPolicy::ZeroColumn => {
                    replacements.push((name, Column::Float(vec![Some(0.0); parsed.len()])));
                    ValidationIssue {
                        column: name.to_string(),
                        reason: format!(
                            "{} non-numeric cells; column replaced with zeros",
                            failures.len()
                        ),
                    }
                }
                CoercionPolicy::DropRows => {
                    for &i in &failures {
                        bad_rows[i] = true;
                    }
                    replacements.push((name, Column::Float(parsed)));
                    ValidationIssue {
                        column: name.to_string(),
                        reason: format!("{} non-numeric cells; rows dropped", failures.len()),
                    }
                }
            };
            warn!(symbol = %label, issue = %issue, "validation repair applied");
            report.issues.push(issue);
        }

        for (name, column) in replacements {
            // Same length as the index by construction.
            if let Err(e) = ds.insert_column(name, column) {
                error!(symbol = %label, error = %e, "failed to replace coerced column");
            }
        }

        if bad_rows.iter().any(|&b| b) {
            let keep: Vec<usize> = (0..ds.len()).filter(|&i| !bad_rows[i]).collect();
            report.rows_dropped_coercion = ds.len() - keep.len();
            ds = ds.take_rows(&keep);
        }
        ds
    }

    fn add_daily_return(&self, ds: &mut Dataset, label: &str) {
        let Some(closes) = ds.floats(CLOSE) else {
            warn!(symbol = %label, "no numeric close column; daily_return not computed");
            return;
        };

        let returns = daily_returns(closes);
        if let Err(e) = ds.insert_column(DAILY_RETURN, Column::Float(returns)) {
            error!(symbol = %label, error = %e, "failed to add daily_return");
            return;
        }
        debug!(symbol = %label, "calculated daily_return");
    }

    fn flag_outliers(&self, ds: &Dataset, label: &str, report: &mut CleanReport) {
        let (Some(returns), Some(index)) = (ds.floats(DAILY_RETURN), ds.utc_index()) else {
            return;
        };

        report.outliers = returns
            .iter()
            .zip(index)
            .filter(|(r, _)| r.map_or(false, |v| v.abs() > self.outlier_threshold))
            .map(|(_, ts)| *ts)
            .collect();

        if !report.outliers.is_empty() {
            warn!(
                symbol = %label,
                count = report.outliers.len(),
                threshold = self.outlier_threshold,
                "potential outliers detected by daily_return threshold"
            );
            debug!(symbol = %label, at = ?report.outliers, "outlier timestamps");
        }
    }
}

/// Simple percentage change. Row 0 and any 0/0 result are 0; a division by
/// a zero close keeps its infinity.
pub fn daily_returns(closes: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(closes.len());
    for i in 0..closes.len() {
        let r = if i == 0 {
            0.0
        } else {
            match (closes[i - 1], closes[i]) {
                (Some(prev), Some(cur)) => cur / prev - 1.0,
                _ => f64::NAN,
            }
        };
        out.push(Some(if r.is_nan() { 0.0 } else { r }));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::dataset::{TimeIndex, HIGH, LOW, OPEN, VOLUME};
    use chrono::{NaiveDate, TimeZone};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 5, 0, 0).unwrap() + chrono::Duration::days(i64::from(d) - 1)
    }

    fn frame(closes: &[Option<f64>]) -> Dataset {
        let n = closes.len();
        let mut ds = Dataset::new(TimeIndex::Utc((1..=n as u32).map(day).collect()));
        let flat = |v: f64| Column::Float(vec![Some(v); n]);
        ds.insert_column(OPEN, flat(10.0)).unwrap();
        ds.insert_column(HIGH, flat(12.0)).unwrap();
        ds.insert_column(LOW, flat(9.0)).unwrap();
        ds.insert_column(CLOSE, Column::Float(closes.to_vec())).unwrap();
        ds.insert_column(VOLUME, flat(1_000.0)).unwrap();
        ds
    }

    #[test]
    fn empty_input_yields_none() {
        assert!(Preprocessor::default().clean(&Dataset::default(), "EMPTY").is_none());
    }

    #[test]
    fn daily_return_first_row_is_zero() {
        let ds = frame(&[Some(100.0), Some(110.0), Some(99.0)]);
        let out = Preprocessor::default().clean(&ds, "T").unwrap();
        let r = out.floats(DAILY_RETURN).unwrap();
        assert_eq!(r[0], Some(0.0));
        assert!((r[1].unwrap() - 0.10).abs() < 1e-12);
        assert!((r[2].unwrap() - (99.0 / 110.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn interior_gap_takes_preceding_value() {
        let ds = frame(&[Some(100.0), Some(101.0), None, Some(103.0)]);
        let (out, report) = Preprocessor::default().clean_with_report(&ds, "T").unwrap();
        assert_eq!(out.value(CLOSE, 2), Some(101.0));
        assert_eq!(report.missing_before, vec![(CLOSE.to_string(), 1)]);
        assert_eq!(report.rows_dropped_missing, 0);
    }

    #[test]
    fn leading_gap_is_back_filled() {
        let ds = frame(&[None, Some(101.0), Some(102.0)]);
        let out = Preprocessor::default().clean(&ds, "T").unwrap();
        assert_eq!(out.value(CLOSE, 0), Some(101.0));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn entirely_missing_column_drops_every_row() {
        let mut ds = frame(&[Some(1.0), Some(2.0)]);
        ds.insert_column("vwap", Column::Float(vec![None, None])).unwrap();
        let (out, report) = Preprocessor::default().clean_with_report(&ds, "T").unwrap();
        assert!(out.is_empty());
        assert_eq!(report.rows_dropped_missing, 2);
    }

    #[test]
    fn unparseable_column_zeroed_by_default() {
        let mut ds = frame(&[Some(1.0), Some(2.0)]);
        ds.insert_column(
            VOLUME,
            Column::Text(vec![Some("100".into()), Some("n/a".into())]),
        )
        .unwrap();
        let (out, report) = Preprocessor::default().clean_with_report(&ds, "T").unwrap();
        assert_eq!(out.floats(VOLUME).unwrap(), &[Some(0.0), Some(0.0)]);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].column, VOLUME);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn unparseable_rows_dropped_when_configured() {
        let mut ds = frame(&[Some(1.0), Some(2.0), Some(3.0)]);
        ds.insert_column(
            CLOSE,
            Column::Text(vec![Some("1.5".into()), Some("oops".into()), Some(" 3 ".into())]),
        )
        .unwrap();
        let pre = Preprocessor::new(CoercionPolicy::DropRows, DEFAULT_OUTLIER_THRESHOLD);
        let (out, report) = pre.clean_with_report(&ds, "T").unwrap();
        assert_eq!(out.floats(CLOSE).unwrap(), &[Some(1.5), Some(3.0)]);
        assert_eq!(report.rows_dropped_coercion, 1);
        assert_eq!(out.utc_index().unwrap(), &[day(1), day(3)]);
    }

    #[test]
    fn numeric_text_is_converted_silently() {
        let mut ds = frame(&[Some(1.0), Some(2.0)]);
        ds.insert_column(OPEN, Column::Text(vec![Some("1".into()), Some("2.5".into())]))
            .unwrap();
        let (out, report) = Preprocessor::default().clean_with_report(&ds, "T").unwrap();
        assert_eq!(out.floats(OPEN).unwrap(), &[Some(1.0), Some(2.5)]);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn outliers_are_flagged_not_removed() {
        let ds = frame(&[Some(100.0), Some(120.0), Some(119.0), Some(90.0)]);
        let (out, report) = Preprocessor::default().clean_with_report(&ds, "T").unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(report.outliers, vec![day(2), day(4)]);
    }

    #[test]
    fn naive_index_localized_and_sorted() {
        let naive = |d: u32| {
            NaiveDate::from_ymd_opt(2023, 1, d)
                .unwrap()
                .and_hms_opt(5, 0, 0)
                .unwrap()
        };
        let mut ds = Dataset::new(TimeIndex::Naive(vec![naive(2), naive(1)]));
        ds.insert_column(CLOSE, Column::Float(vec![Some(2.0), Some(1.0)]))
            .unwrap();
        let (out, report) = Preprocessor::default().clean_with_report(&ds, "T").unwrap();
        assert_eq!(report.timezone, TimezoneAction::Localized);
        assert!(report.reordered);
        assert_eq!(out.utc_index().unwrap(), &[day(1), day(2)]);
        assert_eq!(out.floats(DAILY_RETURN).unwrap(), &[Some(0.0), Some(1.0)]);
    }

    #[test]
    fn zero_over_zero_return_is_zero() {
        let r = daily_returns(&[Some(0.0), Some(0.0), Some(5.0)]);
        assert_eq!(r[1], Some(0.0));
        assert!(r[2].unwrap().is_infinite());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn closes() -> impl Strategy<Value = Vec<Option<f64>>> {
            proptest::collection::vec(
                prop_oneof![4 => (1.0f64..1_000.0).prop_map(Some), 1 => Just(None)],
                1..40,
            )
            .prop_filter("needs one present close", |v| v.iter().any(Option::is_some))
        }

        proptest! {
            #[test]
            fn clean_is_idempotent(c in closes()) {
                let pre = Preprocessor::default();
                let once = pre.clean(&frame(&c), "P").unwrap();
                let twice = pre.clean(&once, "P").unwrap();
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn daily_return_matches_definition(c in closes()) {
                let out = Preprocessor::default().clean(&frame(&c), "P").unwrap();
                let close = out.floats(CLOSE).unwrap();
                let r = out.floats(DAILY_RETURN).unwrap();
                prop_assert_eq!(r[0], Some(0.0));
                for i in 1..close.len() {
                    let expected = close[i].unwrap() / close[i - 1].unwrap() - 1.0;
                    prop_assert!((r[i].unwrap() - expected).abs() < 1e-12);
                }
            }
        }
    }
}
