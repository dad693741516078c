//! Ledger record type and message helpers.

use {
    chrono::{DateTime, TimeDelta, Utc},
    serde::{Deserialize, Serialize},
};

/// Default cap on persisted outcome messages, in characters.
pub const MESSAGE_MAX_LENGTH: usize = 1000;

/// One completed run attempt. Append-only once written to a ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub code: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Schedule-specific marker. Only fixed-time schedules write it: the
    /// `HH:MM` slot the run satisfied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_extra: Option<String>,
}

impl ExecutionRecord {
    /// A record for an attempt that has just begun.
    #[must_use]
    pub fn started(code: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            code: code.into(),
            started_at,
            finished_at: None,
            success: false,
            message: String::new(),
            schedule_extra: None,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Option<TimeDelta> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Whether a fixed-time schedule tagged this record with a slot.
    #[must_use]
    pub fn has_fixed_marker(&self) -> bool {
        self.schedule_extra.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Keep the trailing `max_len` characters of `message`.
///
/// The tail is kept because failure diagnostics put the innermost cause last.
#[must_use]
pub fn truncate_message(message: String, max_len: usize) -> String {
    let len = message.chars().count();
    if len <= max_len {
        return message;
    }
    message.chars().skip(len - max_len).collect()
}

/// Encode a job code into a file name stem.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`, so distinct codes never map
/// to the same file.
pub(crate) fn file_stem(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    for b in code.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    #[test]
    fn short_message_is_kept_verbatim() {
        assert_eq!(truncate_message("hello".into(), 10), "hello");
        assert_eq!(truncate_message("hello".into(), 5), "hello");
    }

    #[test]
    fn long_message_keeps_the_tail() {
        let msg = format!("{}{}", "a".repeat(1500), "b".repeat(1000));
        let out = truncate_message(msg, MESSAGE_MAX_LENGTH);
        assert_eq!(out.chars().count(), MESSAGE_MAX_LENGTH);
        assert!(out.chars().all(|c| c == 'b'));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let out = truncate_message("ééééé".into(), 3);
        assert_eq!(out, "ééé");
    }

    #[test]
    fn record_json_roundtrip_keeps_marker() {
        let started = Utc.with_ymd_and_hms(2014, 1, 1, 0, 5, 1).unwrap();
        let rec = ExecutionRecord {
            finished_at: Some(started + TimeDelta::seconds(3)),
            success: true,
            message: "ok".into(),
            schedule_extra: Some("00:05".into()),
            ..ExecutionRecord::started("reports.daily", started)
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("scheduleExtra"));
        let back: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
        assert_eq!(back.duration(), Some(TimeDelta::seconds(3)));
        assert!(back.has_fixed_marker());
    }

    #[test]
    fn empty_marker_is_not_a_fixed_marker() {
        let mut rec = ExecutionRecord::started("x", Utc::now());
        assert!(!rec.has_fixed_marker());
        rec.schedule_extra = Some(String::new());
        assert!(!rec.has_fixed_marker());
    }

    #[test]
    fn file_stem_escapes_separators() {
        assert_eq!(file_stem("reports.daily"), "reports.daily");
        assert_eq!(file_stem("a/b"), "a%2Fb");
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
        assert_eq!(file_stem("50%"), "50%25");
    }
}
