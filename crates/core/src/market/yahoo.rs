use crate::market::source::{DataSource, HttpFetcher};
use crate::market::types::{DailyBar, DateRange, PriceSeries};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveTime};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

/// Primary international provider (Yahoo chart API), queried with the symbol as typed.
#[derive(Debug, Clone)]
pub struct YahooSource {
    http: HttpFetcher,
    base_url: String,
}

impl YahooSource {
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("YAHOO_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            http: HttpFetcher::from_env()?,
            base_url,
        })
    }

    fn chart_url(&self, symbol: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url).context("invalid Yahoo base url")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Yahoo base url cannot carry a path"))?
            .pop_if_empty()
            .extend(["v8", "finance", "chart", symbol.trim()]);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl DataSource for YahooSource {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    fn label(&self) -> &'static str {
        "(Yahoo)"
    }

    async fn attempt(&self, symbol: &str, range: &DateRange) -> Result<Option<PriceSeries>> {
        let url = self.chart_url(symbol)?;
        let (period1, period2) = period_bounds(range);
        let query = [
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
            ("interval", "1d".to_string()),
            ("events", "history".to_string()),
        ];

        let text = self
            .http
            .send_text(self.name(), |http| http.get(url.clone()).query(&query))
            .await?;

        let chart = serde_json::from_str::<YahooChartResponse>(&text)
            .context("failed to parse Yahoo chart response")?;
        let bars = parse_chart(chart)?;
        if bars.is_empty() {
            return Ok(None);
        }
        Ok(Some(PriceSeries::new(symbol.trim(), bars)))
    }
}

/// Unix bounds for the chart query. The end day is exclusive: `period2` is midnight
/// UTC at the start of `end`.
fn period_bounds(range: &DateRange) -> (i64, i64) {
    let start = range.start.and_time(NaiveTime::MIN).and_utc().timestamp();
    let end = range.end.and_time(NaiveTime::MIN).and_utc().timestamp();
    (start, end)
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartResponse {
    chart: YahooChartData,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartData {
    #[serde(default)]
    result: Option<Vec<YahooChartResult>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartResult {
    #[serde(default)]
    meta: Option<YahooChartMeta>,
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: YahooChartIndicators,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartIndicators {
    #[serde(default)]
    quote: Vec<YahooChartQuote>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

fn parse_chart(res: YahooChartResponse) -> Result<Vec<DailyBar>> {
    if let Some(error) = res.chart.error.filter(|e| !e.is_null()) {
        anyhow::bail!("Yahoo chart API error: {error}");
    }

    let Some(result) = res.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let Some(timestamps) = result.timestamp else {
        return Ok(Vec::new());
    };
    let Some(quote) = result.indicators.quote.into_iter().next() else {
        return Ok(Vec::new());
    };
    let offset = result.meta.map(|m| m.gmtoffset).unwrap_or(0);

    let at = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten();
    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.iter().enumerate() {
        let Some(dt) = DateTime::from_timestamp(ts + offset, 0) else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            at(&quote.open, i),
            at(&quote.high, i),
            at(&quote.low, i),
            at(&quote.close, i),
        ) else {
            continue;
        };
        bars.push(DailyBar {
            date: dt.date_naive(),
            open,
            high,
            low,
            close,
            volume: at(&quote.volume, i).unwrap_or(0.0),
        });
    }
    Ok(bars)
}
