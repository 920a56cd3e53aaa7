use std::fmt::{self, Display};
use thiserror::Error;

/// Runtime value of a camera parameter.
///
/// `Composite` is the value of a multi-parameter: an ordered tuple of the
/// component values, rebuilt atomically when any component changes within a
/// single poll response.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Composite(Vec<ParamValue>),
}

impl ParamValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        ParamValue::Text(value.into())
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{}", value),
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Text(value) => write!(f, "{}", value),
            ParamValue::Composite(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Declared shape of a parameter value in the spec registry.
///
/// An empty `choices` slice means the wire value is a free-form string
/// (display values, timecode) that is mirrored but never validated.
#[derive(Debug, PartialEq)]
pub enum ValueSpec {
    Bool,
    Int { min: i64, max: i64, step: Option<i64> },
    Choice { choices: &'static [&'static str] },
    Composite,
}

impl ValueSpec {
    /// Validate a locally written value against this spec.
    ///
    /// Out-of-range integers are rejected, not clamped, so no HTTP traffic
    /// is generated for them.
    pub fn validate(&self, value: &ParamValue) -> Result<(), ValidationError> {
        match (self, value) {
            (ValueSpec::Bool, ParamValue::Bool(_)) => Ok(()),
            (ValueSpec::Int { min, max, .. }, ParamValue::Int(v)) => {
                if v < min || v > max {
                    Err(ValidationError::OutOfRange { value: *v, min: *min, max: *max })
                } else {
                    Ok(())
                }
            }
            (ValueSpec::Choice { choices }, ParamValue::Text(v)) => {
                if choices.is_empty() || choices.contains(&v.as_str()) {
                    Ok(())
                } else {
                    Err(ValidationError::UnknownChoice { value: v.clone() })
                }
            }
            (ValueSpec::Composite, ParamValue::Composite(_)) => Ok(()),
            _ => Err(ValidationError::TypeMismatch),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("value {value} outside of [{min}, {max}]")]
    OutOfRange { value: i64, min: i64, max: i64 },
    #[error("'{value}' is not a valid choice")]
    UnknownChoice { value: String },
    #[error("value type does not match the parameter spec")]
    TypeMismatch,
    #[error("parameter is read-only")]
    ReadOnly,
    #[error("rejected: {reason}")]
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const IRIS: ValueSpec = ValueSpec::Int { min: 0, max: 255, step: None };
    const MODES: ValueSpec = ValueSpec::Choice { choices: &["Auto", "Manual"] };
    const FREE: ValueSpec = ValueSpec::Choice { choices: &[] };

    #[rstest]
    #[case(IRIS, ParamValue::Int(0))]
    #[case(IRIS, ParamValue::Int(255))]
    #[case(MODES, ParamValue::text("Auto"))]
    #[case(FREE, ParamValue::text("anything goes"))]
    #[case(ValueSpec::Bool, ParamValue::Bool(true))]
    fn validate_accepts_values_within_the_spec(#[case] spec: ValueSpec, #[case] value: ParamValue) {
        assert_eq!(spec.validate(&value), Ok(()));
    }

    #[rstest]
    #[case(ParamValue::Int(-1))]
    #[case(ParamValue::Int(256))]
    fn validate_rejects_out_of_range_ints(#[case] value: ParamValue) {
        let result = IRIS.validate(&value);

        assert_eq!(
            result,
            Err(ValidationError::OutOfRange { value: value.as_int().unwrap(), min: 0, max: 255 })
        );
    }

    #[test]
    fn validate_rejects_unknown_choices() {
        let result = MODES.validate(&ParamValue::text("Turbo"));

        assert_eq!(result, Err(ValidationError::UnknownChoice { value: "Turbo".to_string() }));
    }

    #[rstest]
    #[case(IRIS, ParamValue::Bool(true))]
    #[case(ValueSpec::Bool, ParamValue::Int(1))]
    #[case(MODES, ParamValue::Int(3200))]
    fn validate_rejects_mismatched_types(#[case] spec: ValueSpec, #[case] value: ParamValue) {
        assert_eq!(spec.validate(&value), Err(ValidationError::TypeMismatch));
    }
}
