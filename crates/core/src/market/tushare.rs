use crate::config::Settings;
use crate::market::source::{DataSource, HttpFetcher};
use crate::market::symbol::{to_domestic_code, MarketClass};
use crate::market::types::{DailyBar, DateRange, PriceSeries};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "http://api.tushare.pro";
const DAILY_API: &str = "daily";
const DAILY_FIELDS: &str = "ts_code,trade_date,open,high,low,close,vol";

/// Domestic A-share provider. Requires a token; without one the resolver never
/// builds this source.
#[derive(Debug, Clone)]
pub struct TushareSource {
    http: HttpFetcher,
    base_url: String,
    token: String,
}

impl TushareSource {
    /// `None` when `TUSHARE_TOKEN` is absent, which silently disables the domestic path.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        let Some(token) = settings.tushare_token.clone() else {
            tracing::debug!("TUSHARE_TOKEN not configured; domestic provider disabled");
            return Ok(None);
        };

        let base_url = settings
            .tushare_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Some(Self {
            http: HttpFetcher::from_env()?,
            base_url,
            token,
        }))
    }

    async fn fetch_daily(&self, ts_code: &str, range: &DateRange) -> Result<Vec<DailyBar>> {
        let (start, end) = range.compact();
        let req = TushareRequest {
            api_name: DAILY_API,
            token: &self.token,
            params: DailyParams {
                ts_code,
                start_date: &start,
                end_date: &end,
            },
            fields: DAILY_FIELDS,
        };

        let text = self
            .http
            .send_text(self.name(), |http| http.post(self.base_url.as_str()).json(&req))
            .await?;

        let body = serde_json::from_str::<TushareResponse>(&text)
            .context("failed to parse Tushare response")?;
        parse_daily_bars(body)
    }
}

#[async_trait::async_trait]
impl DataSource for TushareSource {
    fn name(&self) -> &'static str {
        "tushare"
    }

    fn label(&self) -> &'static str {
        "(Tushare)"
    }

    fn applies_to(&self, class: MarketClass) -> bool {
        class == MarketClass::Domestic
    }

    async fn attempt(&self, symbol: &str, range: &DateRange) -> Result<Option<PriceSeries>> {
        let Some(ts_code) = to_domestic_code(symbol) else {
            tracing::debug!(%symbol, "no exchange mapping for domestic symbol; skipping Tushare");
            return Ok(None);
        };

        let bars = self.fetch_daily(&ts_code, range).await?;
        if bars.is_empty() {
            return Ok(None);
        }
        Ok(Some(PriceSeries::new(ts_code, bars)))
    }
}

#[derive(Debug, Serialize)]
struct TushareRequest<'a> {
    api_name: &'a str,
    token: &'a str,
    params: DailyParams<'a>,
    fields: &'a str,
}

#[derive(Debug, Serialize)]
struct DailyParams<'a> {
    ts_code: &'a str,
    start_date: &'a str,
    end_date: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct TushareResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<TushareTable>,
}

#[derive(Debug, Clone, Deserialize)]
struct TushareTable {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    items: Vec<Vec<Value>>,
}

/// Columns are located by name; rows with a missing price are dropped.
fn parse_daily_bars(body: TushareResponse) -> Result<Vec<DailyBar>> {
    if body.code != 0 {
        anyhow::bail!(
            "Tushare error code {}: {}",
            body.code,
            body.msg.unwrap_or_default()
        );
    }
    let Some(table) = body.data else {
        return Ok(Vec::new());
    };

    let col = |name: &str| {
        table
            .fields
            .iter()
            .position(|f| f == name)
            .with_context(|| format!("Tushare response missing column {name}"))
    };
    let date_idx = col("trade_date")?;
    let open_idx = col("open")?;
    let high_idx = col("high")?;
    let low_idx = col("low")?;
    let close_idx = col("close")?;
    let vol_idx = col("vol")?;

    let mut bars = Vec::with_capacity(table.items.len());
    for row in &table.items {
        let Some(date) = row
            .get(date_idx)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y%m%d").ok())
        else {
            continue;
        };
        let num = |idx: usize| row.get(idx).and_then(Value::as_f64);
        let (Some(open), Some(high), Some(low), Some(close)) =
            (num(open_idx), num(high_idx), num(low_idx), num(close_idx))
        else {
            continue;
        };

        bars.push(DailyBar {
            date,
            open,
            high,
            low,
            close,
            volume: num(vol_idx).unwrap_or(0.0),
        });
    }
    Ok(bars)
}
