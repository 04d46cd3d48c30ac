pub mod cn_market;

pub use cn_market::{parse_ymd, today_cst};
