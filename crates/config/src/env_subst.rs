/// Expand `${NAME}` and `${NAME:-fallback}` in raw config text before parsing.
///
/// Unset names without a fallback stay as written, so a missing secret shows
/// up verbatim in the parsed value instead of as an empty string.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: keep the remainder literally.
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };
        match (name.is_empty(), lookup(name).filter(|v| !v.is_empty()), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "REDIS_HOST" => Some("cache.internal".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_names() {
        assert_eq!(
            substitute_env_with("url = \"redis://${REDIS_HOST}:6379/\"", lookup),
            "url = \"redis://cache.internal:6379/\""
        );
    }

    #[test]
    fn fallback_applies_to_unset_and_empty() {
        assert_eq!(substitute_env_with("${NOPE:-/tmp}", lookup), "/tmp");
        assert_eq!(substitute_env_with("${EMPTY:-x}", lookup), "x");
        assert_eq!(substitute_env_with("${REDIS_HOST:-x}", lookup), "cache.internal");
    }

    #[test]
    fn unknown_and_malformed_placeholders_stay_literal() {
        assert_eq!(substitute_env_with("${NOPE}", lookup), "${NOPE}");
        assert_eq!(substitute_env_with("${}", lookup), "${}");
        assert_eq!(substitute_env_with("a ${REDIS_HOST", lookup), "a ${REDIS_HOST");
        assert_eq!(substitute_env_with("cost: $5", lookup), "cost: $5");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
