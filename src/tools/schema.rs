use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::SchemaError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl SchemaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|number| number.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Schema of one tool parameter, serialized in JSON-Schema shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "minLength", default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(rename = "maxLength", default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn new(kind: SchemaType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            allowed: Vec::new(),
            default: None,
            format: None,
            min_length: None,
            max_length: None,
            minimum: None,
            maximum: None,
            items: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new(SchemaType::String, description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::new(SchemaType::Number, description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::new(SchemaType::Integer, description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::new(SchemaType::Boolean, description)
    }

    pub fn array(items: PropertySchema, description: impl Into<String>) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::new(SchemaType::Array, description)
        }
    }

    pub fn with_enum<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_range(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    pub fn with_length(mut self, min_length: usize, max_length: usize) -> Self {
        self.min_length = Some(min_length);
        self.max_length = Some(max_length);
        self
    }

    fn check_value(&self, path: &str, value: &Value) -> Result<(), String> {
        if !self.kind.matches(value) {
            return Err(format!(
                "parameter '{path}' must be of type {}",
                self.kind.as_str()
            ));
        }

        if !self.allowed.is_empty() && !self.allowed.contains(value) {
            let allowed = self
                .allowed
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(format!("parameter '{path}' must be one of [{allowed}]"));
        }

        if let Some(number) = value.as_f64() {
            if let Some(minimum) = self.minimum.filter(|minimum| number < *minimum) {
                return Err(format!("parameter '{path}' must be >= {minimum}"));
            }
            if let Some(maximum) = self.maximum.filter(|maximum| number > *maximum) {
                return Err(format!("parameter '{path}' must be <= {maximum}"));
            }
        }

        if let Some(text) = value.as_str() {
            let length = text.chars().count();
            if let Some(min_length) = self.min_length.filter(|min| length < *min) {
                return Err(format!(
                    "parameter '{path}' must be at least {min_length} characters"
                ));
            }
            if let Some(max_length) = self.max_length.filter(|max| length > *max) {
                return Err(format!(
                    "parameter '{path}' must be at most {max_length} characters"
                ));
            }
        }

        if let (Some(items), Some(values)) = (&self.items, value.as_array()) {
            for (index, item) in values.iter().enumerate() {
                items.check_value(&format!("{path}[{index}]"), item)?;
            }
        }

        Ok(())
    }
}

/// Root parameter schema of a tool; always an object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::object()
    }
}

impl ParameterSchema {
    pub fn object() -> Self {
        Self {
            kind: SchemaType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
            description: None,
        }
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn required_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, schema);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn to_json_schema(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"type": "object", "properties": {}}))
    }

    /// Structural checks run once, when a tool is registered.
    pub fn check(&self) -> Result<(), SchemaError> {
        if self.kind != SchemaType::Object {
            return Err(SchemaError::RootTypeMustBeObject);
        }
        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !self.properties.contains_key(*name))
        {
            return Err(SchemaError::UnknownRequired(missing.clone()));
        }
        Ok(())
    }

    /// Checks required presence, unknown names, types, enums and ranges.
    pub fn validate(&self, parameters: &Map<String, Value>) -> Result<(), String> {
        for name in &self.required {
            if !parameters.contains_key(name) {
                return Err(format!("missing required parameter: {name}"));
            }
        }

        for (name, value) in parameters {
            let Some(schema) = self.properties.get(name) else {
                return Err(format!("unknown parameter: {name}"));
            };
            if value.is_null() && !self.required.contains(name) {
                continue;
            }
            schema.check_value(name, value)?;
        }

        Ok(())
    }
}
