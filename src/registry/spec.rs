use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ConfigError;

/// Capability set a component provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Input,
    Buffer,
    Processor,
    Output,
    Cache,
    RateLimit,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 6] = [
        ComponentKind::Input,
        ComponentKind::Buffer,
        ComponentKind::Processor,
        ComponentKind::Output,
        ComponentKind::Cache,
        ComponentKind::RateLimit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ComponentKind::Input => "input",
            ComponentKind::Buffer => "buffer",
            ComponentKind::Processor => "processor",
            ComponentKind::Output => "output",
            ComponentKind::Cache => "cache",
            ComponentKind::RateLimit => "rate_limit",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of shared resource a field may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cache,
    RateLimit,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cache => f.write_str("cache"),
            ResourceKind::RateLimit => f.write_str("rate_limit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Bool,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Bool => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Stable,
    Beta,
    Deprecated,
}

/// Schema for one configuration field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub advanced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            default: None,
            required: true,
            min: None,
            max: None,
            options: Vec::new(),
            advanced: false,
            resource: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn references(mut self, kind: ResourceKind) -> Self {
        self.resource = Some(kind);
        self
    }

    fn check(
        &self,
        component: &str,
        value: &Value,
        resource_exists: &dyn Fn(ResourceKind, &str) -> bool,
    ) -> Result<(), ConfigError> {
        if value.is_null() && !self.required {
            return Ok(());
        }

        if !self.field_type.accepts(value) {
            return Err(ConfigError::InvalidType {
                component: component.to_string(),
                field: self.name.clone(),
                expected: self.field_type.name().to_string(),
                found: json_type_name(value).to_string(),
            });
        }

        if let Some(n) = value.as_f64() {
            let below = self.min.is_some_and(|min| n < min);
            let above = self.max.is_some_and(|max| n > max);
            if below || above {
                return Err(ConfigError::OutOfRange {
                    component: component.to_string(),
                    field: self.name.clone(),
                    value: n,
                    min: self.min,
                    max: self.max,
                });
            }
        }

        if let Some(s) = value.as_str() {
            if !self.options.is_empty() && !self.options.iter().any(|o| o == s) {
                return Err(ConfigError::InvalidOption {
                    component: component.to_string(),
                    field: self.name.clone(),
                    value: s.to_string(),
                    options: self.options.clone(),
                });
            }

            if let Some(kind) = self.resource {
                if !resource_exists(kind, s) {
                    return Err(ConfigError::UnknownResource {
                        component: component.to_string(),
                        field: self.name.clone(),
                        kind,
                        name: s.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Complete description of a component type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: ComponentKind,
    pub summary: String,
    pub status: Status,
    pub fields: Vec<FieldSpec>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            summary: String::new(),
            status: Status::Stable,
            fields: Vec::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn add_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check `config` against the declared fields and return it with defaults filled in.
    pub fn validate(
        &self,
        component: &str,
        config: &Value,
        resource_exists: &dyn Fn(ResourceKind, &str) -> bool,
    ) -> Result<Value, ConfigError> {
        let empty = Map::new();
        let provided = match config {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(ConfigError::InvalidType {
                    component: component.to_string(),
                    field: "config".to_string(),
                    expected: "object".to_string(),
                    found: json_type_name(other).to_string(),
                })
            }
        };

        if let Some(unknown) = provided.keys().find(|k| self.field(k).is_none()) {
            return Err(ConfigError::UnknownField {
                component: component.to_string(),
                field: unknown.clone(),
            });
        }

        let mut normalized = Map::new();
        for field in &self.fields {
            let value = match provided.get(&field.name).or(field.default.as_ref()) {
                Some(value) => value,
                None if field.required => {
                    return Err(ConfigError::MissingField {
                        component: component.to_string(),
                        field: field.name.clone(),
                    })
                }
                None => continue,
            };

            field.check(component, value, resource_exists)?;
            normalized.insert(field.name.clone(), value.clone());
        }

        Ok(Value::Object(normalized))
    }

    /// Config object populated with every default, used to generate configs.
    /// Fields without a default are left out for the user to fill in.
    pub fn example_config(&self, include_advanced: bool) -> Value {
        let fields = self
            .fields
            .iter()
            .filter(|f| include_advanced || !f.advanced)
            .filter_map(|f| Some((f.name.clone(), f.default.clone()?)))
            .collect();
        Value::Object(fields)
    }
}

/// Interpret a default written in an attribute: JSON if it parses, otherwise a plain string.
pub fn parse_default(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_resources(_: ResourceKind, _: &str) -> bool {
        false
    }

    fn sample() -> ComponentSpec {
        ComponentSpec::new("sample", ComponentKind::Processor)
            .add_field(
                FieldSpec::new("count", FieldType::Integer)
                    .with_default(json!(10))
                    .with_range(Some(1.0), Some(100.0)),
            )
            .add_field(
                FieldSpec::new("mode", FieldType::String)
                    .with_default(json!("fast"))
                    .with_options(&["fast", "slow"]),
            )
            .add_field(FieldSpec::new("target", FieldType::String))
            .add_field(FieldSpec::new("note", FieldType::String).optional())
    }

    #[test]
    fn test_defaults_filled() {
        let out = sample()
            .validate("sample", &json!({"target": "x"}), &no_resources)
            .unwrap();
        assert_eq!(out, json!({"count": 10, "mode": "fast", "target": "x"}));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = sample()
            .validate("sample", &json!({"target": "x", "cuont": 3}), &no_resources)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { ref field, .. } if field == "cuont"));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = sample()
            .validate("sample", &json!({"target": "x", "count": 0}), &no_resources)
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref field, .. } if field == "count"));
    }

    #[test]
    fn test_missing_and_wrong_type() {
        let err = sample().validate("sample", &json!({}), &no_resources).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));

        let err = sample()
            .validate("sample", &json!({"target": 5}), &no_resources)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidType { .. }));
    }

    #[test]
    fn test_option_list_enforced() {
        let err = sample()
            .validate("sample", &json!({"target": "x", "mode": "warp"}), &no_resources)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { .. }));
    }

    #[test]
    fn test_example_config_leaves_out_fields_without_default() {
        let example = sample().example_config(true);
        assert_eq!(example, json!({"count": 10, "mode": "fast"}));
    }

    #[test]
    fn test_parse_default() {
        assert_eq!(parse_default("1000"), json!(1000));
        assert_eq!(parse_default("\"get\""), json!("get"));
        assert_eq!(parse_default("\n"), json!("\n"));
    }
}
