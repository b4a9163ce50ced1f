//! Attribute engine: validates and coerces entry attributes against the
//! owning logbook's declared specs.
//!
//! Input arrives as untyped JSON; in memory a value is one of the
//! [`AttributeValue`] variants. Validation is forgiving:
//! unknown names and values that fail coercion are dropped with a warning,
//! only *missing required* names reject the whole operation. The same
//! coercion runs lazily at read time so historical entries survive schema
//! changes on their logbook.

use serde_json::{Map, Value};

use crate::model::{AttributeSpec, AttributeType};

/// A typed attribute value, the in-memory shape of one entry of the
/// per-logbook attribute dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Option(String),
    MultiOption(Vec<String>),
}

impl AttributeValue {
    /// The plain JSON representation stored in the database.
    pub fn into_value(self) -> Value {
        match self {
            Self::Text(s) | Self::Option(s) => Value::String(s),
            Self::Number(n) => serde_json::Number::from_f64(n)
                .map_or(Value::Null, Value::Number),
            Self::Bool(b) => Value::Bool(b),
            Self::MultiOption(items) => {
                Value::Array(items.into_iter().map(Value::String).collect())
            }
        }
    }
}

/// Why a single attribute value was rejected.
#[derive(Debug, thiserror::Error)]
pub enum CoercionError {
    #[error("expected a number, got {0}")]
    NotANumber(Value),

    #[error("expected text, got {0}")]
    NotText(Value),

    #[error("value {0} is not one of the declared options")]
    UnknownOption(String),

    #[error("a multioption value must be a non-empty list of strings")]
    BadMultiOption,

    #[error("no value")]
    Missing,
}

/// Why an attribute dictionary was rejected as a whole.
#[derive(Debug, thiserror::Error)]
pub enum AttributeError {
    #[error("missing required attributes: {}", names.join(", "))]
    MissingRequired { names: Vec<String> },
}

/// Validate and coerce a candidate attribute dictionary at create/edit time.
///
/// Missing required names fail the whole operation. Unknown names and
/// coercion failures on recognised names are dropped with a warning.
pub fn check_attributes(
    specs: &[AttributeSpec],
    candidate: &Map<String, Value>,
) -> Result<Map<String, Value>, AttributeError> {
    let missing: Vec<String> = specs
        .iter()
        .filter(|spec| spec.required && !candidate.contains_key(&spec.name))
        .map(|spec| spec.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(AttributeError::MissingRequired { names: missing });
    }

    let mut checked = Map::new();
    for (name, value) in candidate {
        let Some(spec) = specs.iter().find(|s| s.name == *name) else {
            tracing::warn!(attribute = %name, "dropping unknown attribute");
            continue;
        };
        match coerce(spec, value) {
            Ok(coerced) => {
                checked.insert(name.clone(), coerced.into_value());
            }
            Err(err) => {
                tracing::warn!(attribute = %name, %err, "dropping attribute that failed coercion");
            }
        }
    }
    Ok(checked)
}

/// Re-coerce stored attributes for display.
///
/// Historical entries may predate a schema change on their logbook; values
/// that no longer coerce (or whose name is no longer declared) are simply
/// omitted from the view. The stored row is left untouched.
pub fn convert_for_display(
    specs: &[AttributeSpec],
    stored: &Map<String, Value>,
) -> Map<String, Value> {
    let mut converted = Map::new();
    for (name, value) in stored {
        if let Some(spec) = specs.iter().find(|s| s.name == *name)
            && let Ok(coerced) = coerce(spec, value)
        {
            converted.insert(name.clone(), coerced.into_value());
        }
    }
    converted
}

/// Coerce one untyped value to the type its spec declares.
pub fn coerce(spec: &AttributeSpec, value: &Value) -> Result<AttributeValue, CoercionError> {
    if value.is_null() {
        return Err(CoercionError::Missing);
    }
    match spec.kind {
        AttributeType::Text => coerce_text(value),
        AttributeType::Number => coerce_number(value),
        AttributeType::Boolean => Ok(AttributeValue::Bool(truthy(value))),
        AttributeType::Option => coerce_option(spec, value),
        AttributeType::Multioption => coerce_multioption(spec, value),
    }
}

fn coerce_text(value: &Value) -> Result<AttributeValue, CoercionError> {
    match value {
        Value::String(s) => Ok(AttributeValue::Text(s.clone())),
        Value::Number(n) => Ok(AttributeValue::Text(n.to_string())),
        Value::Bool(b) => Ok(AttributeValue::Text(b.to_string())),
        other => Err(CoercionError::NotText(other.clone())),
    }
}

fn coerce_number(value: &Value) -> Result<AttributeValue, CoercionError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(AttributeValue::Number)
            .ok_or_else(|| CoercionError::NotANumber(value.clone())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(AttributeValue::Number)
            .map_err(|_| CoercionError::NotANumber(value.clone())),
        other => Err(CoercionError::NotANumber(other.clone())),
    }
}

/// String truthiness follows form submission conventions: the literal
/// strings "false" and "0" (and the empty string) are false.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0")
        }
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn coerce_option(spec: &AttributeSpec, value: &Value) -> Result<AttributeValue, CoercionError> {
    let Value::String(s) = value else {
        return Err(CoercionError::NotText(value.clone()));
    };
    if spec.options.iter().any(|o| o == s) {
        Ok(AttributeValue::Option(s.clone()))
    } else {
        Err(CoercionError::UnknownOption(s.clone()))
    }
}

fn coerce_multioption(
    spec: &AttributeSpec,
    value: &Value,
) -> Result<AttributeValue, CoercionError> {
    // A bare string is accepted as a single-element selection.
    let items: Vec<String> = match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(CoercionError::BadMultiOption),
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(CoercionError::BadMultiOption),
    };
    for item in &items {
        if !spec.options.iter().any(|o| o == item) {
            return Err(CoercionError::UnknownOption(item.clone()));
        }
    }
    Ok(AttributeValue::MultiOption(items))
}
