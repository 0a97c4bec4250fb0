//! Typed field conversion.
//!
//! Integers go through a bounded hand-rolled loop so error messages stay
//! deterministic and the digit cap applies before accumulation; floats
//! special-case the accepted infinity/NaN spellings and then defer to the
//! standard library's Eisel-Lemire parser; booleans match the configured
//! sets case-insensitively.

use super::config::ExtractionConfig;

/// Outcome of a typed field access: the value, a recognized missing value,
/// or a malformed literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractResult<T> {
    Ok(T),
    /// The field matched the NA set (or was empty after trimming).
    Na,
    ParseError(String),
}

impl<T> ExtractResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExtractResult::Ok(_))
    }

    pub fn is_na(&self) -> bool {
        matches!(self, ExtractResult::Na)
    }

    pub fn is_err(&self) -> bool {
        matches!(self, ExtractResult::ParseError(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ExtractResult::Ok(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse NA and parse errors to `default`.
    pub fn get_or(self, default: T) -> T {
        match self {
            ExtractResult::Ok(v) => v,
            _ => default,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExtractResult<U> {
        match self {
            ExtractResult::Ok(v) => ExtractResult::Ok(f(v)),
            ExtractResult::Na => ExtractResult::Na,
            ExtractResult::ParseError(e) => ExtractResult::ParseError(e),
        }
    }
}

/// Trim ASCII space and tab from both ends.
pub(crate) fn trim_blanks(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Types that can be produced from a trimmed, NA-filtered field.
pub trait FieldParse: Sized {
    fn parse_field(text: &str, config: &ExtractionConfig) -> ExtractResult<Self>;
}

fn parse_integer(text: &str, config: &ExtractionConfig, signed: bool) -> ExtractResult<i128> {
    let bytes = text.as_bytes();
    let (negative, digits) = match bytes.first() {
        Some(b'+') => (false, &bytes[1..]),
        Some(b'-') if signed => (true, &bytes[1..]),
        Some(b'-') => {
            return ExtractResult::ParseError(format!("negative value \"{text}\" for unsigned type"))
        }
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return ExtractResult::ParseError(format!("\"{text}\" is not an integer"));
    }
    if digits.len() > usize::from(config.max_integer_digits) {
        return ExtractResult::ParseError(format!(
            "\"{text}\" has more than {} digits",
            config.max_integer_digits
        ));
    }
    if !config.allow_leading_zeros && digits.len() > 1 && digits[0] == b'0' {
        return ExtractResult::ParseError(format!("\"{text}\" has a leading zero"));
    }
    let mut value: i128 = 0;
    for &b in digits {
        // Branchless-friendly digit test: one wrapping subtract and compare.
        let d = b.wrapping_sub(b'0');
        if d > 9 {
            return ExtractResult::ParseError(format!("\"{text}\" is not an integer"));
        }
        value = match value.checked_mul(10).and_then(|v| v.checked_add(i128::from(d))) {
            Some(v) => v,
            None => {
                return ExtractResult::ParseError(format!("\"{text}\" is out of range"));
            }
        };
    }
    ExtractResult::Ok(if negative { -value } else { value })
}

macro_rules! impl_field_parse_int {
    ($($t:ty => $signed:expr),* $(,)?) => {$(
        impl FieldParse for $t {
            fn parse_field(text: &str, config: &ExtractionConfig) -> ExtractResult<Self> {
                match parse_integer(text, config, $signed) {
                    ExtractResult::Ok(v) => match <$t>::try_from(v) {
                        Ok(v) => ExtractResult::Ok(v),
                        Err(_) => ExtractResult::ParseError(format!(
                            "\"{text}\" is out of range for {}",
                            stringify!($t)
                        )),
                    },
                    ExtractResult::Na => ExtractResult::Na,
                    ExtractResult::ParseError(e) => ExtractResult::ParseError(e),
                }
            }
        }
    )*};
}

impl_field_parse_int! {
    i16 => true,
    i32 => true,
    i64 => true,
    u16 => false,
    u32 => false,
    u64 => false,
}

/// Spellings of the float special values accepted verbatim. Any other
/// spelling of infinity or NaN is malformed.
const FLOAT_SPECIALS: &[(&str, f64)] = &[
    ("inf", f64::INFINITY),
    ("Inf", f64::INFINITY),
    ("+inf", f64::INFINITY),
    ("+Inf", f64::INFINITY),
    ("-inf", f64::NEG_INFINITY),
    ("-Inf", f64::NEG_INFINITY),
    ("nan", f64::NAN),
    ("NaN", f64::NAN),
];

impl FieldParse for f64 {
    fn parse_field(text: &str, _config: &ExtractionConfig) -> ExtractResult<Self> {
        for &(spelling, value) in FLOAT_SPECIALS {
            if text == spelling {
                return ExtractResult::Ok(value);
            }
        }
        // The std parser would accept "INFINITY" and friends in any case;
        // only the spellings above are valid here.
        let stripped = text.strip_prefix(['+', '-']).unwrap_or(text);
        if stripped.eq_ignore_ascii_case("inf")
            || stripped.eq_ignore_ascii_case("infinity")
            || stripped.eq_ignore_ascii_case("nan")
        {
            return ExtractResult::ParseError(format!("\"{text}\" is not a number"));
        }
        match text.parse::<f64>() {
            // Overflow maps to the infinities rather than an error.
            Ok(v) => ExtractResult::Ok(v),
            Err(_) => ExtractResult::ParseError(format!("\"{text}\" is not a number")),
        }
    }
}

impl FieldParse for bool {
    fn parse_field(text: &str, config: &ExtractionConfig) -> ExtractResult<Self> {
        let matches_any =
            |set: &std::collections::HashSet<String>| set.iter().any(|v| v.eq_ignore_ascii_case(text));
        if matches_any(&config.true_values) {
            ExtractResult::Ok(true)
        } else if matches_any(&config.false_values) {
            ExtractResult::Ok(false)
        } else {
            ExtractResult::ParseError(format!("\"{text}\" is not a boolean"))
        }
    }
}

impl FieldParse for String {
    fn parse_field(text: &str, _config: &ExtractionConfig) -> ExtractResult<Self> {
        ExtractResult::Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    #[test]
    fn test_trim_blanks() {
        assert_eq!(trim_blanks(b"  x \t"), b"x");
        assert_eq!(trim_blanks(b"\t \t"), b"");
        assert_eq!(trim_blanks(b"abc"), b"abc");
    }

    #[test]
    fn test_parse_i64() {
        assert_eq!(i64::parse_field("42", &config()), ExtractResult::Ok(42));
        assert_eq!(i64::parse_field("-7", &config()), ExtractResult::Ok(-7));
        assert_eq!(i64::parse_field("+7", &config()), ExtractResult::Ok(7));
        assert!(i64::parse_field("4x2", &config()).is_err());
        assert!(i64::parse_field("", &config()).is_err());
    }

    #[test]
    fn test_parse_unsigned_rejects_negative() {
        assert!(u32::parse_field("-1", &config()).is_err());
        assert_eq!(u32::parse_field("7", &config()), ExtractResult::Ok(7));
    }

    #[test]
    fn test_range_enforced() {
        assert!(i16::parse_field("40000", &config()).is_err());
        assert_eq!(
            i16::parse_field("32767", &config()),
            ExtractResult::Ok(32767)
        );
        assert_eq!(
            i64::parse_field("9223372036854775807", &config()),
            ExtractResult::Ok(i64::MAX)
        );
        assert!(u64::parse_field("99999999999999999999", &config()).is_err());
    }

    #[test]
    fn test_leading_zeros() {
        let mut strict = config();
        strict.allow_leading_zeros = false;
        assert!(i64::parse_field("007", &strict).is_err());
        assert_eq!(i64::parse_field("0", &strict), ExtractResult::Ok(0));
        assert_eq!(i64::parse_field("007", &config()), ExtractResult::Ok(7));
    }

    #[test]
    fn test_max_digits() {
        let mut short = config();
        short.max_integer_digits = 3;
        assert!(i64::parse_field("1234", &short).is_err());
        assert_eq!(i64::parse_field("123", &short), ExtractResult::Ok(123));
    }

    #[test]
    fn test_parse_f64() {
        assert_eq!(f64::parse_field("1.5", &config()), ExtractResult::Ok(1.5));
        assert_eq!(
            f64::parse_field("-2.5e3", &config()),
            ExtractResult::Ok(-2500.0)
        );
        assert!(f64::parse_field("1.5x", &config()).is_err());
    }

    #[test]
    fn test_f64_specials_case_sensitive() {
        assert_eq!(
            f64::parse_field("inf", &config()),
            ExtractResult::Ok(f64::INFINITY)
        );
        assert_eq!(
            f64::parse_field("-Inf", &config()),
            ExtractResult::Ok(f64::NEG_INFINITY)
        );
        assert!(f64::parse_field("INF", &config()).is_err());
        assert!(f64::parse_field("Infinity", &config()).is_err());
        assert!(f64::parse_field("NAN", &config()).is_err());
        match f64::parse_field("NaN", &config()) {
            ExtractResult::Ok(v) => assert!(v.is_nan()),
            other => panic!("expected NaN, got {other:?}"),
        }
    }

    #[test]
    fn test_f64_overflow_is_infinite() {
        assert_eq!(
            f64::parse_field("1e999", &config()),
            ExtractResult::Ok(f64::INFINITY)
        );
        assert_eq!(
            f64::parse_field("-1e999", &config()),
            ExtractResult::Ok(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(bool::parse_field("true", &config()), ExtractResult::Ok(true));
        assert_eq!(bool::parse_field("TRUE", &config()), ExtractResult::Ok(true));
        assert_eq!(bool::parse_field("f", &config()), ExtractResult::Ok(false));
        assert!(bool::parse_field("maybe", &config()).is_err());
    }

    #[test]
    fn test_get_or() {
        assert_eq!(ExtractResult::Ok(5).get_or(0), 5);
        assert_eq!(ExtractResult::<i64>::Na.get_or(0), 0);
        assert_eq!(
            ExtractResult::<i64>::ParseError("bad".into()).get_or(0),
            0
        );
    }
}
