//! Daily price retrieval with provider fallback.
//!
//! A query is classified as domestic (A-share) or international, then handed to
//! [`MarketDataResolver`], which walks its ordered [`DataSource`] chain until one
//! returns bars.

pub mod resolver;
pub mod source;
pub mod stooq;
pub mod symbol;
pub mod tushare;
pub mod types;
pub mod yahoo;

pub use resolver::MarketDataResolver;
pub use source::DataSource;
pub use symbol::{classify, to_domestic_code, Exchange, MarketClass};
pub use types::{DailyBar, DateRange, MarketQuery, PriceSeries};
