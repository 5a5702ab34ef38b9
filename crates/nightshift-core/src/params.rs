//! Typed parameter contract for task inputs.
//!
//! A task declares an ordered sequence of [`ParamSpec`]s; at execute time
//! the incoming JSON object is checked against the schema. Errors are
//! accumulated rather than short-circuited so callers can report every
//! problem at once.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON kind a parameter value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    /// Check a JSON value against this kind. `Integer` requires an
    /// integral JSON number, not merely any number.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(s)
    }
}

/// Declaration of a single task parameter.
///
/// A required spec carries no default; an optional spec may carry one.
/// The constructors enforce this, so a hand-built spec is the only way to
/// violate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    /// A required parameter of the given kind.
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
        }
    }

    /// An optional parameter, with an optional default filled in when the
    /// caller omits it.
    pub fn optional(
        name: impl Into<String>,
        kind: ParamKind,
        default: impl Into<Option<Value>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: default.into(),
        }
    }
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("missing required parameter: {0}")]
    MissingRequired(String),

    #[error("invalid type for parameter {name}: expected {expected}")]
    WrongKind { name: String, expected: ParamKind },
}

/// Validate `params` against `schema`, producing a normalized map.
///
/// On success the returned map contains every incoming entry (extras pass
/// through untouched) plus defaults for absent optional parameters. On
/// failure, every problem found is returned in schema order.
pub fn validate_params(
    schema: &[ParamSpec],
    params: &Map<String, Value>,
) -> Result<Map<String, Value>, Vec<ParamError>> {
    let mut errors = Vec::new();
    let mut normalized = params.clone();

    for spec in schema {
        match params.get(&spec.name) {
            Some(value) => {
                if !spec.kind.matches(value) {
                    errors.push(ParamError::WrongKind {
                        name: spec.name.clone(),
                        expected: spec.kind,
                    });
                }
            }
            None => {
                if spec.required {
                    errors.push(ParamError::MissingRequired(spec.name.clone()));
                } else if let Some(default) = &spec.default {
                    normalized.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(normalized)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("test value is an object")
    }

    #[test]
    fn valid_params_pass() {
        let schema = vec![
            ParamSpec::required("exposure", ParamKind::Number),
            ParamSpec::required("filter", ParamKind::String),
            ParamSpec::optional("dither", ParamKind::Boolean, Some(json!(false))),
        ];
        let params = obj(json!({"exposure": 30.0, "filter": "Ha", "dither": true}));

        let normalized = validate_params(&schema, &params).expect("should validate");
        assert_eq!(normalized["dither"], json!(true));
    }

    #[test]
    fn missing_required_reported_per_param() {
        let schema = vec![
            ParamSpec::required("exposure", ParamKind::Number),
            ParamSpec::required("gain", ParamKind::Integer),
        ];
        let errors = validate_params(&schema, &Map::new()).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0],
            ParamError::MissingRequired("exposure".to_owned())
        );
        assert_eq!(errors[1], ParamError::MissingRequired("gain".to_owned()));
    }

    #[test]
    fn wrong_kind_reported() {
        let schema = vec![ParamSpec::required("exposure", ParamKind::Number)];
        let params = obj(json!({"exposure": "thirty"}));

        let errors = validate_params(&schema, &params).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "invalid type for parameter exposure: expected number"
        );
    }

    #[test]
    fn integer_kind_rejects_fractional_numbers() {
        let schema = vec![ParamSpec::required("gain", ParamKind::Integer)];
        assert!(validate_params(&schema, &obj(json!({"gain": 100}))).is_ok());
        assert!(validate_params(&schema, &obj(json!({"gain": 1.5}))).is_err());
    }

    #[test]
    fn defaults_filled_for_absent_optionals() {
        let schema = vec![ParamSpec::optional(
            "gain",
            ParamKind::Integer,
            Some(json!(100)),
        )];
        let normalized = validate_params(&schema, &Map::new()).expect("should validate");
        assert_eq!(normalized["gain"], json!(100));
    }

    #[test]
    fn present_value_wins_over_default() {
        let schema = vec![ParamSpec::optional(
            "gain",
            ParamKind::Integer,
            Some(json!(100)),
        )];
        let normalized =
            validate_params(&schema, &obj(json!({"gain": 250}))).expect("should validate");
        assert_eq!(normalized["gain"], json!(250));
    }

    #[test]
    fn extras_pass_through() {
        let schema = vec![ParamSpec::required("exposure", ParamKind::Number)];
        let params = obj(json!({"exposure": 1.0, "note": "leo triplet"}));

        let normalized = validate_params(&schema, &params).expect("should validate");
        assert_eq!(normalized["note"], json!("leo triplet"));
    }

    #[test]
    fn errors_accumulate_across_params() {
        let schema = vec![
            ParamSpec::required("exposure", ParamKind::Number),
            ParamSpec::required("gain", ParamKind::Integer),
            ParamSpec::required("filter", ParamKind::String),
        ];
        let params = obj(json!({"gain": "high"}));

        let errors = validate_params(&schema, &params).unwrap_err();
        // Missing exposure, wrong-kind gain, missing filter.
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn nested_object_and_array_kinds() {
        let schema = vec![
            ParamSpec::required("binning", ParamKind::Object),
            ParamSpec::required("slots", ParamKind::Array),
        ];
        let params = obj(json!({"binning": {"x": 2, "y": 2}, "slots": [1, 2, 3]}));
        assert!(validate_params(&schema, &params).is_ok());
    }

    #[test]
    fn required_constructor_has_no_default() {
        let spec = ParamSpec::required("exposure", ParamKind::Number);
        assert!(spec.required);
        assert!(spec.default.is_none());
    }
}
