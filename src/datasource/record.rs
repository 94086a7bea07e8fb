//! Datasource records as handled at the service boundary.
//!
//! A request may carry its config either as a mapping or as the serialized
//! text stored in the registry; a record always holds the decoded mapping.

use std::collections::BTreeMap;

use data_connector::{parse_config_text, serialize_config, ConfigMap, DatasourceId, DatasourceRow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DseError, DseResult};

/// Placeholder substituted for secret config values.
pub const HIDDEN_PLACEHOLDER: &str = "<hidden>";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Map(BTreeMap<String, Value>),
    Text(String),
}

/// Create request as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigValue>,
}

impl DatasourceRequest {
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            ..Default::default()
        }
    }

    pub fn with_config<K, V>(mut self, config: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.config = Some(ConfigValue::Map(
            config
                .into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into())))
                .collect(),
        ));
        self
    }
}

/// Normalized datasource record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceRecord {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub description: Option<String>,
    /// Reserved; always null.
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub enabled: bool,
    pub config: ConfigMap,
}

fn decode_config(config: Option<&ConfigValue>) -> DseResult<ConfigMap> {
    match config {
        None => Ok(ConfigMap::new()),
        Some(ConfigValue::Text(text)) => parse_config_text(Some(text))
            .map(Option::unwrap_or_default)
            .map_err(|e| DseError::BadConfig(format!("config is not a JSON mapping: {e}"))),
        Some(ConfigValue::Map(map)) => Ok(map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()),
    }
}

impl DatasourceRecord {
    /// Normalize a request: generate an id if absent, default `enabled` to
    /// true and decode serialized config.
    pub fn from_request(req: &DatasourceRequest) -> DseResult<Self> {
        let id = match req.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => DatasourceId::generate().0,
        };
        Ok(Self {
            id,
            name: req.name.clone(),
            driver: req.driver.clone(),
            description: req.description.clone(),
            type_: None,
            enabled: req.enabled.unwrap_or(true),
            config: decode_config(req.config.as_ref())?,
        })
    }

    pub fn from_row(row: &DatasourceRow) -> DseResult<Self> {
        let config = parse_config_text(row.config.as_deref())
            .map_err(|e| {
                DseError::DataServiceError(format!("stored config of {} is corrupt: {e}", row.id))
            })?
            .unwrap_or_default();
        Ok(Self {
            id: row.id.0.clone(),
            name: row.name.clone(),
            driver: row.driver.clone(),
            description: row.description.clone(),
            type_: None,
            enabled: row.enabled,
            config,
        })
    }

    pub fn to_row(&self) -> DseResult<DatasourceRow> {
        let config = serialize_config(Some(&self.config))
            .map_err(|e| DseError::BadConfig(format!("config cannot be serialized: {e}")))?;
        Ok(DatasourceRow {
            id: DatasourceId(self.id.clone()),
            name: self.name.clone(),
            driver: self.driver.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            config,
        })
    }

    pub fn ds_id(&self) -> DatasourceId {
        DatasourceId(self.id.clone())
    }

    /// Replace the value of every listed secret present in the config.
    pub fn redact(&mut self, secrets: &[String]) {
        for field in secrets {
            if let Some(value) = self.config.get_mut(field) {
                *value = HIDDEN_PLACEHOLDER.to_string();
            }
        }
    }

    /// Replace every config value; used when the owning driver is unknown.
    pub fn redact_all(&mut self) {
        for value in self.config.values_mut() {
            *value = HIDDEN_PLACEHOLDER.to_string();
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Keep only `fields`; an empty list keeps everything.
    pub fn project(&self, fields: &[&str]) -> Map<String, Value> {
        let Value::Object(map) = self.to_value() else {
            return Map::new();
        };
        if fields.is_empty() {
            return map;
        }
        map.into_iter()
            .filter(|(k, _)| fields.contains(&k.as_str()))
            .collect()
    }
}

/// Normalize a request into its record shape, optionally projected to
/// `fields`.
pub fn make_datasource_dict(
    req: &DatasourceRequest,
    fields: Option<&[&str]>,
) -> DseResult<Map<String, Value>> {
    let record = DatasourceRecord::from_request(req)?;
    Ok(record.project(fields.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalization_fills_defaults() {
        let req = DatasourceRequest::new("nova", "fake_datasource");
        let dict = make_datasource_dict(&req, None).unwrap();

        assert!(uuid::Uuid::parse_str(dict["id"].as_str().unwrap()).is_ok());
        assert_eq!(dict["enabled"], json!(true));
        assert_eq!(dict["type"], Value::Null);
        assert_eq!(dict["description"], Value::Null);
        assert_eq!(dict["config"], json!({}));
    }

    #[test]
    fn existing_id_is_kept() {
        let req = DatasourceRequest {
            id: Some("abc".into()),
            enabled: Some(false),
            ..DatasourceRequest::new("nova", "fake_datasource")
        };
        let record = DatasourceRecord::from_request(&req).unwrap();
        assert_eq!(record.id, "abc");
        assert!(!record.enabled);
    }

    #[test]
    fn serialized_config_is_decoded() {
        let req: DatasourceRequest = serde_json::from_value(json!({
            "name": "nova",
            "driver": "fake_datasource",
            "config": "{\"username\": \"admin\"}",
        }))
        .unwrap();
        let record = DatasourceRecord::from_request(&req).unwrap();
        assert_eq!(record.config["username"], "admin");

        let bad = DatasourceRequest {
            config: Some(ConfigValue::Text("not json".into())),
            ..req
        };
        assert!(matches!(
            DatasourceRecord::from_request(&bad),
            Err(DseError::BadConfig(_))
        ));
    }

    #[test]
    fn non_string_values_are_stringified() {
        let req: DatasourceRequest = serde_json::from_value(json!({
            "name": "nova",
            "driver": "fake_datasource",
            "config": {"poll_time": 10},
        }))
        .unwrap();
        let record = DatasourceRecord::from_request(&req).unwrap();
        assert_eq!(record.config["poll_time"], "10");
    }

    #[test]
    fn projection_keeps_requested_fields() {
        let req = DatasourceRequest::new("nova", "fake_datasource");
        let dict = make_datasource_dict(&req, Some(&["name", "driver"])).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict["name"], "nova");
    }

    #[test]
    fn row_conversion_preserves_config() {
        let req = DatasourceRequest::new("nova", "fake_datasource")
            .with_config([("username", "admin"), ("password", "p@ss \"w\"")]);
        let record = DatasourceRecord::from_request(&req).unwrap();
        let row = record.to_row().unwrap();
        assert!(row.config.as_deref().unwrap().contains("username"));
        assert_eq!(DatasourceRecord::from_row(&row).unwrap(), record);
    }

    #[test]
    fn redaction() {
        let req = DatasourceRequest::new("nova", "fake_datasource")
            .with_config([("username", "admin"), ("password", "secret")]);
        let mut record = DatasourceRecord::from_request(&req).unwrap();
        record.redact(&["password".to_string(), "token".to_string()]);
        assert_eq!(record.config["password"], HIDDEN_PLACEHOLDER);
        assert_eq!(record.config["username"], "admin");
        assert!(!record.config.contains_key("token"));

        record.redact_all();
        assert_eq!(record.config["username"], HIDDEN_PLACEHOLDER);
    }
}
