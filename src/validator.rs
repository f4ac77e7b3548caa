//! JSON-Schema argument validation (C6).

use serde_json::Value;

use crate::error::BrokerError;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

/// Validate `arguments` against `schema`, collecting every violation rather
/// than stopping at the first (callers need the full list to report back to
/// a model that produced bad tool-call arguments).
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<ValidationOutcome, BrokerError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| BrokerError::Internal(format!("invalid tool schema: {e}")))?;

    let errors: Vec<ValidationError> = validator
        .iter_errors(arguments)
        .map(|e| ValidationError {
            path: e.instance_path.to_string(),
            message: e.to_string(),
        })
        .collect();

    Ok(ValidationOutcome {
        valid: errors.is_empty(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "count": {"type": "integer", "minimum": 0}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let outcome =
            validate_arguments(&object_schema(), &serde_json::json!({"path": "a.txt", "count": 3})).unwrap();
        assert!(outcome.valid);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn missing_required_field_reported() {
        let outcome = validate_arguments(&object_schema(), &serde_json::json!({"count": 3})).unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn wrong_type_reported_with_path() {
        let outcome =
            validate_arguments(&object_schema(), &serde_json::json!({"path": "a.txt", "count": "three"})).unwrap();
        assert!(!outcome.valid);
        assert!(outcome.errors.iter().any(|e| e.path.contains("count")));
    }

    #[test]
    fn multiple_violations_all_collected() {
        let outcome = validate_arguments(&object_schema(), &serde_json::json!({"count": -1, "extra": true})).unwrap();
        assert!(!outcome.valid);
        assert!(outcome.errors.len() >= 2, "required + additionalProperties + minimum");
    }

    #[test]
    fn malformed_schema_yields_internal_error() {
        let bad_schema = serde_json::json!({"type": "not-a-real-type"});
        let result = validate_arguments(&bad_schema, &serde_json::json!({}));
        assert!(result.is_err());
    }
}
