use crate::config::Settings;
use crate::market::source::{DataSource, HttpFetcher};
use crate::market::types::{DailyBar, DateRange, PriceSeries};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://stooq.com/q/d/l/";
const DEFAULT_COUNTRY: &str = "us";

/// Secondary international provider (Stooq CSV download). Does not cover A-shares.
#[derive(Debug, Clone)]
pub struct StooqSource {
    http: HttpFetcher,
    base_url: String,
}

impl StooqSource {
    /// `None` when the secondary source is switched off with `STOOQ_ENABLED=false`.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        if !settings.stooq_enabled {
            return Ok(None);
        }
        let base_url =
            std::env::var("STOOQ_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Some(Self {
            http: HttpFetcher::from_env()?,
            base_url,
        }))
    }
}

#[async_trait::async_trait]
impl DataSource for StooqSource {
    fn name(&self) -> &'static str {
        "stooq"
    }

    fn label(&self) -> &'static str {
        "(Fallback)"
    }

    async fn attempt(&self, symbol: &str, range: &DateRange) -> Result<Option<PriceSeries>> {
        let (d1, d2) = range.compact();
        let query = [
            ("s", stooq_symbol(symbol)),
            ("d1", d1),
            ("d2", d2),
            ("i", "d".to_string()),
        ];

        let text = self
            .http
            .send_text(self.name(), |http| {
                http.get(self.base_url.as_str()).query(&query)
            })
            .await?;

        let bars = parse_csv(&text)?;
        if bars.is_empty() {
            return Ok(None);
        }
        Ok(Some(PriceSeries::new(symbol.trim(), bars)))
    }
}

/// Bare tickers get the default market suffix; indices (`^SPX`) and already
/// qualified symbols pass through.
fn stooq_symbol(symbol: &str) -> String {
    let s = symbol.trim().to_ascii_lowercase();
    if s.starts_with('^') || s.contains('.') {
        s
    } else {
        format!("{s}.{DEFAULT_COUNTRY}")
    }
}

const REQUIRED_COLUMNS: [&str; 5] = ["date", "open", "high", "low", "close"];

/// One row of the Stooq daily download. Headers are lowercased before decoding;
/// index downloads carry no volume column.
#[derive(Debug, Deserialize)]
struct StooqRow {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
}

fn parse_csv(text: &str) -> Result<Vec<DailyBar>> {
    let body = text.trim();
    if body.is_empty() || body.eq_ignore_ascii_case("no data") {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(body.as_bytes());

    let headers: csv::StringRecord = reader
        .headers()
        .context("failed to read Stooq CSV header")?
        .iter()
        .map(str::to_ascii_lowercase)
        .collect();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            let first_line = body.lines().next().unwrap_or_default();
            anyhow::bail!("Stooq CSV missing column {column}: {first_line}");
        }
    }
    reader.set_headers(headers);

    let mut bars = Vec::new();
    for row in reader.deserialize::<StooqRow>() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed Stooq row");
                continue;
            }
        };
        bars.push(DailyBar {
            date: row.date,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume.unwrap_or(0.0),
        });
    }
    Ok(bars)
}
