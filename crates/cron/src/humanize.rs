use chrono::TimeDelta;

const UNITS: [(&str, i64); 4] = [("day", 86_400), ("hour", 3_600), ("minute", 60), ("second", 1)];

/// Render a duration as `"1 day, 2 hours, 1 second"`. Sub-second
/// remainders are dropped; anything under a second is `"< 1 second"`.
pub fn humanize_duration(duration: TimeDelta) -> String {
    let mut remaining = duration.num_seconds().max(0);
    let mut parts = Vec::new();
    for (name, size) in UNITS {
        let count = remaining / size;
        remaining %= size;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {name}{plural}"));
        }
    }
    if parts.is_empty() {
        "< 1 second".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(TimeDelta::zero(), "< 1 second")]
    #[case(TimeDelta::milliseconds(999), "< 1 second")]
    #[case(TimeDelta::seconds(-5), "< 1 second")]
    #[case(TimeDelta::seconds(1), "1 second")]
    #[case(TimeDelta::seconds(90), "1 minute, 30 seconds")]
    #[case(TimeDelta::seconds(86_400 + 3_600 + 60 + 1), "1 day, 1 hour, 1 minute, 1 second")]
    #[case(TimeDelta::hours(48), "2 days")]
    fn formats(#[case] duration: TimeDelta, #[case] expected: &str) {
        assert_eq!(humanize_duration(duration), expected);
    }
}
