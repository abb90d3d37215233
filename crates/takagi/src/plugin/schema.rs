// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Plugin configuration schema validation.
//!
//! A schema maps option keys to field specs (`type`, `required`,
//! `default`, `enum`, `range`, custom validators). Validation fills in
//! defaults, rejects missing required keys with an error naming the
//! plugin and the key, and lets unknown keys pass through untouched.

use super::PluginError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Expected JSON shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// JSON number (integer or float).
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }
}

/// Custom validation callback.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Constraints for one option key.
#[derive(Clone, Default)]
pub struct FieldSpec {
    field_type: Option<FieldType>,
    required: bool,
    default: Option<Value>,
    allowed: Option<Vec<Value>>,
    range: Option<(f64, f64)>,
    validator: Option<Validator>,
}

impl FieldSpec {
    /// Unconstrained field.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the key to be present (unless a default fills it).
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Constrain the JSON type.
    pub fn of(mut self, field_type: FieldType) -> Self {
        self.field_type = Some(field_type);
        self
    }

    /// Value used when the key is absent.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Restrict to an enumerated set of values.
    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Restrict numeric values to an inclusive range.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Attach a custom validation callback.
    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }
}

/// Schema for a plugin's options map.
#[derive(Clone, Default)]
pub struct ConfigSchema {
    fields: HashMap<String, FieldSpec>,
}

impl ConfigSchema {
    /// Empty schema (everything passes).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field spec.
    pub fn field(mut self, key: &str, spec: FieldSpec) -> Self {
        self.fields.insert(key.to_string(), spec);
        self
    }

    /// Validate `options` in place for `plugin`: defaults are filled in,
    /// unknown keys pass through.
    pub fn apply(&self, plugin: &str, options: &mut Map<String, Value>) -> Result<(), PluginError> {
        for (key, spec) in &self.fields {
            let value = match options.get(key) {
                Some(value) => value.clone(),
                None => {
                    if let Some(default) = &spec.default {
                        options.insert(key.clone(), default.clone());
                        continue;
                    }
                    if spec.required {
                        return Err(config_error(plugin, key, "is required"));
                    }
                    continue;
                }
            };

            if let Some(expected) = spec.field_type {
                if !expected.accepts(&value) {
                    return Err(config_error(
                        plugin,
                        key,
                        &format!("must be a {}", expected.label()),
                    ));
                }
            }
            if let Some(allowed) = &spec.allowed {
                if !allowed.contains(&value) {
                    return Err(config_error(plugin, key, "is not an allowed value"));
                }
            }
            if let Some((min, max)) = spec.range {
                let Some(n) = value.as_f64() else {
                    return Err(config_error(plugin, key, "must be numeric for range check"));
                };
                if n < min || n > max {
                    return Err(config_error(
                        plugin,
                        key,
                        &format!("must be within {}..={}", min, max),
                    ));
                }
            }
            if let Some(validator) = &spec.validator {
                if !validator(&value) {
                    return Err(config_error(plugin, key, "failed validation"));
                }
            }
        }
        Ok(())
    }
}

fn config_error(plugin: &str, key: &str, message: &str) -> PluginError {
    PluginError::ConfigError {
        plugin: plugin.to_string(),
        key: key.to_string(),
        message: message.to_string(),
    }
}
