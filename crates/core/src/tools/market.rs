use crate::market::MarketDataResolver;
use crate::tools::{Tool, ToolRequest, ToolResponse, FINANCIAL_DATA_TOOL};
use serde_json::{json, Value};

/// Daily price lookup. Never fails on provider trouble: the resolver already turns
/// that into a readable diagnostic.
#[derive(Clone)]
pub struct FinancialDataTool {
    resolver: MarketDataResolver,
}

impl FinancialDataTool {
    pub fn new(resolver: MarketDataResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait::async_trait]
impl Tool for FinancialDataTool {
    fn name(&self) -> &'static str {
        FINANCIAL_DATA_TOOL
    }

    fn description(&self) -> &'static str {
        "Fetches daily OHLCV bars for a stock. Input must contain 'symbol', 'start_date' and 'end_date'."
    }

    fn input_schema(&self) -> Value {
        json!({
            "symbol": {"type": "string", "description": "Ticker, e.g. '600519.SS' for Kweichow Moutai or 'AAPL'"},
            "start_date": {"type": "string", "description": "Start date, YYYY-MM-DD"},
            "end_date": {"type": "string", "description": "End date, YYYY-MM-DD"}
        })
    }

    async fn run(&self, request: &ToolRequest) -> anyhow::Result<ToolResponse> {
        let ToolRequest::FinancialData(query) = request else {
            anyhow::bail!("{} cannot serve {} requests", self.name(), request.tool_name());
        };
        tracing::info!(symbol = %query.symbol, start = %query.start_date, end = %query.end_date, "market tool called");
        let output = self
            .resolver
            .fetch(&query.symbol, &query.start_date, &query.end_date)
            .await;
        Ok(ToolResponse::new(self.name(), output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{DailyBar, DataSource, DateRange, MarketQuery, PriceSeries};
    use crate::tools::KnowledgeQuery;
    use std::sync::Arc;

    struct OneBar;

    #[async_trait::async_trait]
    impl DataSource for OneBar {
        fn name(&self) -> &'static str {
            "one-bar"
        }

        fn label(&self) -> &'static str {
            "(Test)"
        }

        async fn attempt(
            &self,
            symbol: &str,
            range: &DateRange,
        ) -> anyhow::Result<Option<PriceSeries>> {
            Ok(Some(PriceSeries::new(
                symbol,
                vec![DailyBar {
                    date: range.start,
                    open: 10.0,
                    high: 11.0,
                    low: 9.5,
                    close: 10.5,
                    volume: 1200.0,
                }],
            )))
        }
    }

    fn tool() -> FinancialDataTool {
        FinancialDataTool::new(MarketDataResolver::new(vec![Arc::new(OneBar)]))
    }

    #[tokio::test]
    async fn returns_resolver_report() {
        let req = ToolRequest::FinancialData(MarketQuery {
            symbol: "AAPL".to_string(),
            start_date: "2024-01-02".to_string(),
            end_date: "2024-01-02".to_string(),
        });
        let res = tool().run(&req).await.unwrap();
        assert_eq!(res.tool, FINANCIAL_DATA_TOOL);
        assert!(res
            .output
            .starts_with("(Test) fetched daily bars for AAPL from 2024-01-02 to 2024-01-02:"));
    }

    #[tokio::test]
    async fn bad_dates_still_produce_output() {
        let req = ToolRequest::FinancialData(MarketQuery {
            symbol: "AAPL".to_string(),
            start_date: "2024/01/02".to_string(),
            end_date: "2024-01-05".to_string(),
        });
        let res = tool().run(&req).await.unwrap();
        assert!(res.output.starts_with("Failed to fetch daily bars for AAPL"));
    }

    #[tokio::test]
    async fn rejects_other_requests() {
        let req = ToolRequest::KnowledgeBase(KnowledgeQuery {
            query: "beta".to_string(),
        });
        assert!(tool().run(&req).await.is_err());
    }
}
