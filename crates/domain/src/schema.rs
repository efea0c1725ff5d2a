//! Strict validator for the JSON-Schema subset used by tool argument specs.
//!
//! Supported: `type` ∈ {string, number, integer, boolean, array, object},
//! `required`, `enum`, `description`, `properties`, `items`. Validation is
//! strict — fields not declared in `properties` are rejected.

use serde_json::Value;

use crate::error::{Error, Result};

/// Validate `args` against `schema`, returning `tool_arg_invalid` on the
/// first violation. The error message names the offending path so the model
/// can correct itself.
pub fn validate(schema: &Value, args: &Value) -> Result<()> {
    validate_at(schema, args, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<()> {
    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err(invalid(path, &format!("must be one of {allowed:?}")));
        }
    }

    let Some(ty) = schema.get("type").and_then(|t| t.as_str()) else {
        // No type constraint; enum (if any) was already checked.
        return Ok(());
    };

    match ty {
        "string" => {
            if !value.is_string() {
                return Err(invalid(path, "expected a string"));
            }
        }
        "number" => {
            if !value.is_number() {
                return Err(invalid(path, "expected a number"));
            }
        }
        "integer" => {
            if !value.is_i64() && !value.is_u64() {
                return Err(invalid(path, "expected an integer"));
            }
        }
        "boolean" => {
            if !value.is_boolean() {
                return Err(invalid(path, "expected a boolean"));
            }
        }
        "array" => {
            let Some(items) = value.as_array() else {
                return Err(invalid(path, "expected an array"));
            };
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
        }
        "object" => {
            let Some(obj) = value.as_object() else {
                return Err(invalid(path, "expected an object"));
            };
            let empty = serde_json::Map::new();
            let props = schema
                .get("properties")
                .and_then(|p| p.as_object())
                .unwrap_or(&empty);

            if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
                for req in required.iter().filter_map(|r| r.as_str()) {
                    if !obj.contains_key(req) {
                        return Err(invalid(path, &format!("missing required field '{req}'")));
                    }
                }
            }

            for (key, field) in obj {
                match props.get(key) {
                    Some(field_schema) => {
                        validate_at(field_schema, field, &format!("{path}.{key}"))?
                    }
                    None => {
                        return Err(invalid(path, &format!("unknown field '{key}'")));
                    }
                }
            }
        }
        other => {
            return Err(Error::Internal(format!(
                "tool schema declares unsupported type '{other}' at {path}"
            )));
        }
    }

    Ok(())
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::ToolArgInvalid(format!("{path}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string", "description": "Ticker symbol" },
                "period": { "type": "string", "enum": ["1d", "5d", "1mo"] },
                "limit": { "type": "integer" }
            },
            "required": ["symbol"]
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        let args = json!({ "symbol": "AAPL", "period": "5d", "limit": 10 });
        assert!(validate(&quote_schema(), &args).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate(&quote_schema(), &json!({ "period": "1d" })).unwrap_err();
        assert_eq!(err.kind(), "tool_arg_invalid");
        assert!(err.to_string().contains("symbol"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let args = json!({ "symbol": "AAPL", "verbose": true });
        let err = validate(&quote_schema(), &args).unwrap_err();
        assert!(err.to_string().contains("unknown field 'verbose'"));
    }

    #[test]
    fn rejects_wrong_types() {
        let args = json!({ "symbol": 42 });
        let err = validate(&quote_schema(), &args).unwrap_err();
        assert!(err.to_string().contains("$.symbol"));

        let args = json!({ "symbol": "AAPL", "limit": 2.5 });
        assert!(validate(&quote_schema(), &args).is_err());
    }

    #[test]
    fn rejects_enum_violations() {
        let args = json!({ "symbol": "AAPL", "period": "3y" });
        let err = validate(&quote_schema(), &args).unwrap_err();
        assert_eq!(err.kind(), "tool_arg_invalid");
    }

    #[test]
    fn validates_array_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "symbols": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["symbols"]
        });
        assert!(validate(&schema, &json!({ "symbols": ["AAPL", "TSLA"] })).is_ok());
        assert!(validate(&schema, &json!({ "symbols": ["AAPL", 7] })).is_err());
    }

    #[test]
    fn integer_accepts_u64_and_i64() {
        let schema = json!({ "type": "integer" });
        assert!(validate(&schema, &json!(5)).is_ok());
        assert!(validate(&schema, &json!(-5)).is_ok());
        assert!(validate(&schema, &json!(5.0)).is_err());
    }
}
