//! Structural validation of tool arguments against a tool's `inputSchema`.

use jsonschema::Validator;
use serde_json::Value;

/// A compiled tool input schema.
#[derive(Debug)]
pub struct ArgumentSchema {
    validator: Option<Validator>,
}

impl ArgumentSchema {
    /// Compile `schema`. A schema the validator cannot compile accepts any
    /// JSON object.
    pub fn compile(tool: &str, schema: &Value) -> Self {
        match jsonschema::validator_for(schema) {
            Ok(validator) => Self {
                validator: Some(validator),
            },
            Err(e) => {
                tracing::warn!("Could not compile input schema for '{}': {}", tool, e);
                Self { validator: None }
            }
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.validator.is_some()
    }

    /// Check `arguments`, collecting every violation.
    pub fn validate(&self, arguments: &Value) -> Result<(), Vec<String>> {
        if !arguments.is_object() {
            return Err(vec![format!(
                "arguments must be a JSON object, got {}",
                json_type(arguments)
            )]);
        }

        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(arguments)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_schema() -> ArgumentSchema {
        ArgumentSchema::compile(
            "echo",
            &json!({
                "type": "object",
                "properties": {"text": {"type": "string"}, "count": {"type": "integer"}},
                "required": ["text"]
            }),
        )
    }

    #[test]
    fn accepts_matching_arguments() {
        assert!(echo_schema().validate(&json!({"text": "hi", "count": 2})).is_ok());
    }

    #[test]
    fn reports_missing_required_field() {
        let errors = echo_schema().validate(&json!({})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("text"), "unexpected error: {}", errors[0]);
    }

    #[test]
    fn reports_every_type_mismatch() {
        let errors = echo_schema()
            .validate(&json!({"text": 5, "count": "many"}))
            .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.starts_with("/text")));
        assert!(errors.iter().any(|e| e.starts_with("/count")));
    }

    #[test]
    fn rejects_non_object_arguments() {
        let errors = echo_schema().validate(&json!(["hi"])).unwrap_err();
        assert!(errors[0].contains("got array"));
    }

    #[test]
    fn uncompilable_schema_accepts_any_object() {
        let schema = ArgumentSchema::compile("odd", &json!({"type": 12}));
        assert!(!schema.is_compiled());
        assert!(schema.validate(&json!({"anything": true})).is_ok());
        assert!(schema.validate(&json!("text")).is_err());
    }
}
