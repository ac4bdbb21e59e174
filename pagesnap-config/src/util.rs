use std::time::Duration;

/// Parse a duration such as `"90s"`, `"2m 30s"` or `"250ms"`. A bare
/// integer is taken as `default_unit` multiples.
pub fn parse_duration(raw: &str, default_unit: Duration) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<u32>() {
        return Some(default_unit * n);
    }
    humantime::parse_duration(trimmed).ok()
}

pub fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        let secs = Duration::from_secs(1);
        assert_eq!(parse_duration("90", secs), Some(Duration::from_secs(90)));
        assert_eq!(
            parse_duration("250ms", secs),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            parse_duration("2m 30s", secs),
            Some(Duration::from_secs(150))
        );
        assert_eq!(parse_duration("soon", secs), None);
        assert_eq!(parse_duration("", secs), None);
    }
}
