use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};

// China Standard Time (UTC+8), the calendar the A-share market and the users run on.
const CST_OFFSET_SECS: i32 = 8 * 3600;

/// Calendar date in China Standard Time for the given instant.
pub fn today_cst(now_utc: DateTime<Utc>) -> anyhow::Result<NaiveDate> {
    let cst = chrono::FixedOffset::east_opt(CST_OFFSET_SECS).context("invalid CST offset")?;
    Ok(now_utc.with_timezone(&cst).date_naive())
}

pub fn parse_ymd(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("expected YYYY-MM-DD, got {s:?}"))
}
