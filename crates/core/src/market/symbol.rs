/// Which provider family a ticker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketClass {
    Domestic,
    International,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// Shanghai.
    Sh,
    /// Shenzhen.
    Sz,
    /// Beijing.
    Bj,
}

impl Exchange {
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Sh => "SH",
            Self::Sz => "SZ",
            Self::Bj => "BJ",
        }
    }

    fn from_leading_digit(c: char) -> Option<Self> {
        match c {
            '6' => Some(Self::Sh),
            '0' | '3' => Some(Self::Sz),
            '8' | '4' => Some(Self::Bj),
            _ => None,
        }
    }
}

// `.SS` is the Yahoo spelling of Shanghai and is accepted on input.
const DOMESTIC_MARKERS: [&str; 4] = [".SH", ".SZ", ".BJ", ".SS"];
const DOMESTIC_SUFFIXES: [&str; 3] = [".SH", ".SZ", ".BJ"];

fn canonical(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

fn is_six_digit_code(s: &str) -> bool {
    s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn classify(symbol: &str) -> MarketClass {
    let s = canonical(symbol);
    if is_six_digit_code(&s) || DOMESTIC_MARKERS.iter().any(|m| s.contains(m)) {
        MarketClass::Domestic
    } else {
        MarketClass::International
    }
}

/// Normalizes a domestic ticker into the provider's `<code>.<EXCHANGE>` form.
///
/// Returns `None` when no exchange can be derived (non-numeric `.SS` base, or an
/// unrecognized leading digit).
pub fn to_domestic_code(symbol: &str) -> Option<String> {
    let s = canonical(symbol);

    if s.contains(".SS") {
        let base = s.replace(".SS", "");
        if !base.is_empty() && base.bytes().all(|b| b.is_ascii_digit()) {
            return Some(format!("{base}.{}", Exchange::Sh.suffix()));
        }
        return None;
    }

    if DOMESTIC_SUFFIXES.iter().any(|suf| s.ends_with(suf)) {
        return Some(s);
    }

    if is_six_digit_code(&s) {
        let exchange = s.chars().next().and_then(Exchange::from_leading_digit)?;
        return Some(format!("{s}.{}", exchange.suffix()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_digit_codes_are_domestic() {
        for code in ["600519", "000001", "300750", "830799", "430047", "123456", "999999"] {
            assert_eq!(classify(code), MarketClass::Domestic, "{code}");
        }
    }

    #[test]
    fn exchange_suffixes_are_domestic() {
        for sym in ["600519.SH", "000001.sz", "830799.BJ", "600519.SS", " 600519.ss "] {
            assert_eq!(classify(sym), MarketClass::Domestic, "{sym}");
        }
    }

    #[test]
    fn everything_else_is_international() {
        for sym in ["AAPL", "MSFT", "0700.HK", "60051", "6005190", "BRK-B", ""] {
            assert_eq!(classify(sym), MarketClass::International, "{sym}");
        }
    }

    #[test]
    fn normalizes_by_leading_digit() {
        assert_eq!(to_domestic_code("600519").as_deref(), Some("600519.SH"));
        assert_eq!(to_domestic_code("000001").as_deref(), Some("000001.SZ"));
        assert_eq!(to_domestic_code("300750").as_deref(), Some("300750.SZ"));
        assert_eq!(to_domestic_code("830799").as_deref(), Some("830799.BJ"));
        assert_eq!(to_domestic_code("430047").as_deref(), Some("430047.BJ"));
    }

    #[test]
    fn normalizes_suffixed_codes() {
        assert_eq!(to_domestic_code("600519.ss").as_deref(), Some("600519.SH"));
        assert_eq!(to_domestic_code("000001.sz").as_deref(), Some("000001.SZ"));
        assert_eq!(to_domestic_code("830799.BJ").as_deref(), Some("830799.BJ"));
    }

    #[test]
    fn unrecognized_leading_digit_has_no_normalization() {
        assert_eq!(to_domestic_code("123456"), None);
        assert_eq!(to_domestic_code("999999"), None);
        assert_eq!(to_domestic_code("ABC.SS"), None);
        assert_eq!(to_domestic_code("AAPL"), None);
    }
}
