use crate::config::Settings;
use crate::market::source::DataSource;
use crate::market::stooq::StooqSource;
use crate::market::symbol::{classify, MarketClass};
use crate::market::tushare::TushareSource;
use crate::market::types::{format_report, DateRange};
use crate::market::yahoo::YahooSource;
use std::sync::Arc;

/// Tries each configured source in order and turns the first non-empty series into
/// a report. Every failure path ends in a readable diagnostic; `fetch` never errors.
#[derive(Clone)]
pub struct MarketDataResolver {
    sources: Vec<Arc<dyn DataSource>>,
    secondary_available: bool,
    domestic_configured: bool,
}

struct FailedAttempt {
    source: &'static str,
    reason: String,
}

impl MarketDataResolver {
    pub fn new(sources: Vec<Arc<dyn DataSource>>) -> Self {
        Self {
            sources,
            secondary_available: true,
            domestic_configured: true,
        }
    }

    /// Domestic provider (when a token is configured), then Yahoo, then Stooq
    /// (when enabled).
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut sources: Vec<Arc<dyn DataSource>> = Vec::with_capacity(3);

        let tushare = TushareSource::from_settings(settings)?;
        let domestic_configured = tushare.is_some();
        if let Some(source) = tushare {
            sources.push(Arc::new(source));
        }

        sources.push(Arc::new(YahooSource::from_env()?));

        let stooq = StooqSource::from_settings(settings)?;
        let secondary_available = stooq.is_some();
        if let Some(source) = stooq {
            sources.push(Arc::new(source));
        }

        Ok(Self {
            sources,
            secondary_available,
            domestic_configured,
        })
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn fetch(&self, symbol: &str, start_date: &str, end_date: &str) -> String {
        let symbol = symbol.trim();
        let range = match DateRange::parse(start_date, end_date) {
            Ok(range) => range,
            Err(err) => {
                tracing::warn!(%symbol, start_date, end_date, error = %err, "market query rejected");
                return format!(
                    "Failed to fetch daily bars for {symbol}: {err:#}. \
                     Dates must be YYYY-MM-DD with start_date on or before end_date."
                );
            }
        };

        let class = classify(symbol);
        let mut failures = Vec::new();

        for source in &self.sources {
            if !source.applies_to(class) {
                continue;
            }

            match source.attempt(symbol, &range).await {
                Ok(Some(series)) if !series.is_empty() => {
                    tracing::info!(
                        provider = source.name(),
                        %symbol,
                        bars = series.bars.len(),
                        fallbacks = failures.len(),
                        "market data fetched"
                    );
                    return format_report(source.label(), &series, &range);
                }
                Ok(_) => {
                    tracing::info!(provider = source.name(), %symbol, "market data source returned no bars");
                    failures.push(FailedAttempt {
                        source: source.name(),
                        reason: "no data".to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(provider = source.name(), %symbol, error = %err, "market data source failed");
                    failures.push(FailedAttempt {
                        source: source.name(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        self.diagnostic(symbol, &range, class, &failures)
    }

    fn diagnostic(
        &self,
        symbol: &str,
        range: &DateRange,
        class: MarketClass,
        failures: &[FailedAttempt],
    ) -> String {
        let mut out = format!(
            "Failed to fetch daily bars for {symbol} from {} to {}.",
            range.start, range.end
        );

        if failures.is_empty() {
            out.push_str(" No data source was available for this symbol.");
        } else {
            out.push_str(" Attempts: ");
            let attempts: Vec<String> = failures
                .iter()
                .map(|f| format!("{}: {}", f.source, f.reason))
                .collect();
            out.push_str(&attempts.join("; "));
            out.push('.');
        }

        if !self.secondary_available {
            out.push_str(" The secondary data source is unavailable.");
        }

        out.push_str(" Try a shorter date range or a different symbol (e.g. AAPL, MSFT)");
        if class == MarketClass::Domestic && !self.domestic_configured {
            out.push_str(", or configure TUSHARE_TOKEN in configs/.env for A-share data");
        } else if class == MarketClass::Domestic {
            out.push_str(", and check that the TUSHARE_TOKEN is valid");
        }
        out.push('.');
        out
    }
}
