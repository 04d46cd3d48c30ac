use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Tool-facing market query. Dates are `YYYY-MM-DD` strings and are only parsed
/// inside the resolver, so a malformed date becomes a readable diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketQuery {
    pub symbol: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn parse(start: &str, end: &str) -> anyhow::Result<Self> {
        let start = crate::time::parse_ymd(start)
            .with_context(|| format!("invalid start_date {start:?}"))?;
        let end =
            crate::time::parse_ymd(end).with_context(|| format!("invalid end_date {end:?}"))?;
        anyhow::ensure!(start <= end, "start_date {start} is after end_date {end}");
        Ok(Self { start, end })
    }

    /// Compact numeric form used by the domestic provider (`20240105`).
    pub fn compact(&self) -> (String, String) {
        (
            self.start.format("%Y%m%d").to_string(),
            self.end.format("%Y%m%d").to_string(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    pub bars: Vec<DailyBar>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>, mut bars: Vec<DailyBar>) -> Self {
        bars.sort_by_key(|b| b.date);
        Self {
            symbol: symbol.into(),
            bars,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

/// Renders a series as the single text block handed back to the agent.
pub fn format_report(label: &str, series: &PriceSeries, range: &DateRange) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{label} fetched daily bars for {} from {} to {}:",
        series.symbol, range.start, range.end
    );
    let _ = writeln!(
        out,
        "{:<10} {:>12} {:>12} {:>12} {:>12} {:>16}",
        "Date", "Open", "High", "Low", "Close", "Volume"
    );
    for bar in &series.bars {
        let _ = writeln!(
            out,
            "{:<10} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>16.0}",
            bar.date, bar.open, bar.high, bar.low, bar.close, bar.volume
        );
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(y: i32, m: u32, d: u32, close: f64) -> DailyBar {
        DailyBar {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn series_is_sorted_ascending() {
        let series = PriceSeries::new(
            "AAPL",
            vec![bar(2024, 1, 3, 2.0), bar(2024, 1, 2, 1.0), bar(2024, 1, 4, 3.0)],
        );
        let dates: Vec<_> = series.bars.iter().map(|b| b.date.to_string()).collect();
        assert_eq!(dates, ["2024-01-02", "2024-01-03", "2024-01-04"]);
    }

    #[test]
    fn date_range_rejects_malformed_and_inverted() {
        assert!(DateRange::parse("2024-13-01", "2024-12-31").is_err());
        assert!(DateRange::parse("2024/01/01", "2024-12-31").is_err());
        assert!(DateRange::parse("2024-02-01", "2024-01-01").is_err());

        let range = DateRange::parse("2024-01-05", "2024-02-01").unwrap();
        assert_eq!(
            range.compact(),
            ("20240105".to_string(), "20240201".to_string())
        );
    }

    #[test]
    fn report_carries_label_and_rows() {
        let range = DateRange::parse("2024-01-02", "2024-01-03").unwrap();
        let series = PriceSeries::new("600519.SH", vec![bar(2024, 1, 2, 1700.5)]);
        let report = format_report("(Tushare)", &series, &range);

        let mut lines = report.lines();
        assert_eq!(
            lines.next(),
            Some("(Tushare) fetched daily bars for 600519.SH from 2024-01-02 to 2024-01-03:")
        );
        assert!(lines.next().unwrap().starts_with("Date"));
        assert!(lines.next().unwrap().starts_with("2024-01-02"));
        assert!(lines.next().is_none());
    }
}
