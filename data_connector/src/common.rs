use std::collections::BTreeMap;

/// Decoded datasource configuration: option name to value.
pub type ConfigMap = BTreeMap<String, String>;

/// Parse persisted config text into a [`ConfigMap`].
///
/// Shared across all registry backends.
/// Returns `Ok(None)` for `None`, empty strings, and the literal `"null"`.
pub fn parse_config_text(raw: Option<&str>) -> Result<Option<ConfigMap>, String> {
    match raw {
        Some(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("null") {
                return Ok(None);
            }
            serde_json::from_str::<ConfigMap>(s)
                .map(Some)
                .map_err(|e| e.to_string())
        }
        None => Ok(None),
    }
}

/// Serialize a config mapping for persistence.
pub fn serialize_config(config: Option<&ConfigMap>) -> Result<Option<String>, serde_json::Error> {
    config.map(serde_json::to_string).transpose()
}
