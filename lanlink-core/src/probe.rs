//! Validation probe: is this endpoint an Ollama-compatible chat server?

use serde_json::Value;

/// Path of the model listing used as a health probe.
pub const PROBE_PATH: &str = "/api/tags";

/// Top-level field the listing must contain.
pub const PROBE_FIELD: &str = "models";

pub fn probe_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), PROBE_PATH)
}

/// HTTP 200 and a JSON object with a top-level `models` key. Anything else is a miss.
pub fn is_model_listing(status: u16, body: &[u8]) -> bool {
    if status != 200 {
        return false;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map.contains_key(PROBE_FIELD),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_listing() {
        assert!(is_model_listing(200, br#"{"models":[]}"#));
        assert!(is_model_listing(200, br#"{"models":[{"name":"llama3"}],"x":1}"#));
    }

    #[test]
    fn rejects_everything_else() {
        assert!(!is_model_listing(404, br#"{"models":[]}"#));
        assert!(!is_model_listing(200, br#"{"data":[]}"#));
        assert!(!is_model_listing(200, b"<html>router login</html>"));
        assert!(!is_model_listing(200, br#"["models"]"#));
        assert!(!is_model_listing(200, b""));
    }

    #[test]
    fn url() {
        assert_eq!(probe_url("http://10.0.0.2:11434/"), "http://10.0.0.2:11434/api/tags");
    }
}
