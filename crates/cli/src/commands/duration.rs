//! Human-friendly durations for command-line flags.

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

/// Parses `"500ms"`, `"30s"`, `"15m"`, `"4h"` or `"1d"`.
///
/// # Errors
///
/// Returns an error for an empty string, a missing or unknown unit, or a
/// zero or non-numeric value.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        bail!("Duration string cannot be empty");
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("Duration must have a unit (ms, s, m, h, d)"))?;
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        bail!("Duration must start with a number");
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow!("Invalid number in duration: {digits}"))?;
    if value == 0 {
        bail!("Duration cannot be zero");
    }

    let secs = |mult: u64| Duration::from_secs(value.saturating_mul(mult));
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(secs(1)),
        "m" => Ok(secs(60)),
        "h" => Ok(secs(3_600)),
        "d" => Ok(secs(86_400)),
        other => bail!("Unknown duration unit: {other}. Use ms, s, m, h or d"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("4h").unwrap(), Duration::from_secs(14_400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_duration_trims_and_ignores_case() {
        assert_eq!(parse_duration("  2H ").unwrap(), Duration::from_secs(7_200));
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        assert!(parse_duration("").unwrap_err().to_string().contains("empty"));
        assert!(parse_duration("100").unwrap_err().to_string().contains("unit"));
        assert!(parse_duration("h").unwrap_err().to_string().contains("number"));
        assert!(parse_duration("0s").unwrap_err().to_string().contains("zero"));
        assert!(parse_duration("5w").unwrap_err().to_string().contains("Unknown"));
    }
}
