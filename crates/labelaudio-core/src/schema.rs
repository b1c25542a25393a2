//! Lightweight JSON schema checks for capability inputs.
//!
//! Supports the subset providers actually declare: `type`, `const`, `enum`,
//! `required`, `properties`, `additionalProperties: false`, `items`,
//! `minimum`/`maximum`, `minLength`/`maxLength` and `format: "uri"`.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static HTTP_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/?#]+[^\s]*$").expect("valid uri regex"));

/// Validate `value` against `schema`. A null schema accepts everything.
pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
    if schema.is_null() {
        return Ok(());
    }
    validate_at(value, schema, "$")
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    let schema_obj = schema
        .as_object()
        .ok_or_else(|| format!("schema at '{}' must be an object", path))?;

    if let Some(type_spec) = schema_obj.get("type") {
        check_type(value, type_spec, path)?;
    }

    if let Some(constant) = schema_obj.get("const") {
        if value != constant {
            return Err(format!("{} expected const {}", path, constant));
        }
    }

    if let Some(variants) = schema_obj.get("enum").and_then(Value::as_array) {
        if !variants.iter().any(|candidate| candidate == value) {
            return Err(format!("{} is not one of the allowed values", path));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64) {
            if number < min {
                return Err(format!("{} must be >= {}", path, min));
            }
        }
        if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64) {
            if number > max {
                return Err(format!("{} must be <= {}", path, max));
            }
        }
    }

    if let Some(text) = value.as_str() {
        let len = text.chars().count() as u64;
        if let Some(min) = schema_obj.get("minLength").and_then(Value::as_u64) {
            if len < min {
                return Err(format!("{} shorter than {} chars", path, min));
            }
        }
        if let Some(max) = schema_obj.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                return Err(format!("{} longer than {} chars", path, max));
            }
        }
        if schema_obj.get("format").and_then(Value::as_str) == Some("uri")
            && !HTTP_URI.is_match(text)
        {
            return Err(format!("{} is not an http(s) url with a host", path));
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        let object = value
            .as_object()
            .ok_or_else(|| format!("{} must be an object for required fields", path))?;
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(format!("{} missing required field '{}'", path, key));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        let object = value
            .as_object()
            .ok_or_else(|| format!("{} must be an object for properties validation", path))?;
        for (key, property_schema) in properties {
            if let Some(child) = object.get(key) {
                validate_at(child, property_schema, &format!("{}.{}", path, key))?;
            }
        }
        if schema_obj.get("additionalProperties").and_then(Value::as_bool) == Some(false) {
            if let Some(unknown) = object.keys().find(|key| !properties.contains_key(*key)) {
                return Err(format!("{} contains unknown field '{}'", path, unknown));
            }
        }
    }

    if let Some(item_schema) = schema_obj.get("items") {
        let array = value
            .as_array()
            .ok_or_else(|| format!("{} must be an array for items validation", path))?;
        for (idx, item) in array.iter().enumerate() {
            validate_at(item, item_schema, &format!("{}[{}]", path, idx))?;
        }
    }

    Ok(())
}

fn type_matches(type_name: &str, value: &Value) -> bool {
    match type_name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn check_type(value: &Value, type_spec: &Value, path: &str) -> Result<(), String> {
    let ok = match type_spec {
        Value::String(name) => type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| type_matches(name, value)),
        _ => return Err(format!("{} has an invalid type declaration", path)),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{} expected type {}", path, type_spec))
    }
}
