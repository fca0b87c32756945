//! Parsing of human duration strings such as `90s`, `30m` or `1h30m`.

use std::time::Duration;

/// Parses a sequence of `<integer><unit>` pairs, where unit is one of
/// `ms`, `s`, `m`, `h` or `d`. Whitespace between pairs is ignored.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s.as_str();
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in '{}'", input))?;
        if digits_end == 0 {
            return Err(format!("expected a number in '{}'", input));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|e| format!("invalid number in '{}': {}", input, e))?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let part = match unit {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "d" => value.checked_mul(86400).map(Duration::from_secs),
            other => return Err(format!("unknown unit '{}' in '{}'", other, input)),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("duration '{}' is too large", input))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_units() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_compound() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1h 30m 15s").unwrap(), Duration::from_secs(5415));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("m30").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("1.5h").is_err());
    }

    #[test]
    fn test_overflow_is_an_error() {
        assert!(parse_duration("300000000000000000d").is_err());
        assert!(parse_duration("18446744073709551615s 1s").is_err());
        assert!(parse_duration("99999999999999999999s").is_err());
    }
}
