/// Parse a boolean-like environment flag.
/// Accepts 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_bool_flag(&raw))
}

/// Positive integer from the environment; zero and garbage read as unset.
pub fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Non-blank string from the environment.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env;

    #[test]
    fn parse_bool_flag_recognizes_common_values() {
        assert_eq!(parse_bool_flag("true"), Some(true));
        assert_eq!(parse_bool_flag(" YES "), Some(true));
        assert_eq!(parse_bool_flag("0"), Some(false));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
        assert_eq!(parse_bool_flag(""), None);
    }

    #[test]
    fn env_readers_ignore_blank_and_invalid_values() {
        let mut guard = env::isolated();
        guard.set("FLOWSCOPE_TEST_FLAG", "on");
        assert_eq!(env_bool("FLOWSCOPE_TEST_FLAG"), Some(true));
        guard.set("FLOWSCOPE_TEST_NUM", "0");
        assert_eq!(env_u64("FLOWSCOPE_TEST_NUM"), None);
        guard.set("FLOWSCOPE_TEST_NUM", " 15 ");
        assert_eq!(env_u64("FLOWSCOPE_TEST_NUM"), Some(15));
        guard.set("FLOWSCOPE_TEST_STR", "   ");
        assert_eq!(env_string("FLOWSCOPE_TEST_STR"), None);
        guard.remove("FLOWSCOPE_TEST_FLAG");
        assert_eq!(env_bool("FLOWSCOPE_TEST_FLAG"), None);
    }

    #[test]
    fn scoped_env_leaves_nothing_behind() {
        let mut guard = env::isolated();
        guard.set("FLOWSCOPE_TEST_LEFTOVER", "1");
        drop(guard);
        assert_eq!(env_string("FLOWSCOPE_TEST_LEFTOVER"), None);
    }
}
