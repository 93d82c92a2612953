// crates/conduit-core/src/schema.rs
//
// Declarative value shapes for procedure inputs and outputs, plus
// `SchemaValidator`, the default implementation of the `Validator` boundary.
//
// Object validation strips unknown keys and returns the cleaned value, so
// handlers only ever see fields their contract declares.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::traits::Validator;

/// Extra constraints on string values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    /// `local@domain.tld`
    Email,
    /// RFC 3339 timestamp.
    DateTime,
}

/// A named object member.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
}

impl Field {
    pub fn required(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            required: true,
        }
    }

    pub fn optional(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            required: false,
        }
    }
}

/// The shape a JSON value must have.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// Anything, including `null`.
    Any,
    /// `null` or absent input.
    Null,
    Bool,
    /// A number with no fractional part.
    Integer,
    Number,
    String {
        format: Option<StringFormat>,
        min_len: Option<usize>,
    },
    Array(Box<Schema>),
    Object(Vec<Field>),
    /// `null`, or a value matching the inner schema.
    Nullable(Box<Schema>),
}

impl Schema {
    pub fn string() -> Self {
        Schema::String {
            format: None,
            min_len: None,
        }
    }

    pub fn non_empty_string() -> Self {
        Schema::String {
            format: None,
            min_len: Some(1),
        }
    }

    pub fn email() -> Self {
        Schema::String {
            format: Some(StringFormat::Email),
            min_len: None,
        }
    }

    pub fn datetime() -> Self {
        Schema::String {
            format: Some(StringFormat::DateTime),
            min_len: None,
        }
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array(Box::new(items))
    }

    pub fn object(fields: Vec<Field>) -> Self {
        Schema::Object(fields)
    }

    pub fn nullable(inner: Schema) -> Self {
        Schema::Nullable(Box::new(inner))
    }

    /// Validate `value` against this schema, returning the cleaned value.
    pub fn check(&self, value: &Value) -> Result<Value, ValidationError> {
        let mut path = Vec::new();
        self.check_at(value, &mut path)
    }

    fn check_at(&self, value: &Value, path: &mut Vec<String>) -> Result<Value, ValidationError> {
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::Null => match value {
                Value::Null => Ok(Value::Null),
                other => Err(mismatch(path, "null", other)),
            },
            Schema::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                other => Err(mismatch(path, "boolean", other)),
            },
            Schema::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && fits_i64(f) => Ok(Value::from(f as i64)),
                    Some(f) if f.fract() == 0.0 => Err(ValidationError::new(
                        path.clone(),
                        "Expected integer, received a number outside the 64-bit range",
                    )),
                    _ => Err(ValidationError::new(path.clone(), "Expected integer, received float")),
                },
                other => Err(mismatch(path, "integer", other)),
            },
            Schema::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                other => Err(mismatch(path, "number", other)),
            },
            Schema::String { format, min_len } => {
                let s = match value {
                    Value::String(s) => s,
                    other => return Err(mismatch(path, "string", other)),
                };
                if let Some(min) = min_len {
                    if s.chars().count() < *min {
                        return Err(ValidationError::new(
                            path.clone(),
                            format!("String must contain at least {} character(s)", min),
                        ));
                    }
                }
                match format {
                    Some(StringFormat::Email) if !is_email(s) => {
                        Err(ValidationError::new(path.clone(), "Invalid email"))
                    }
                    Some(StringFormat::DateTime)
                        if chrono::DateTime::parse_from_rfc3339(s).is_err() =>
                    {
                        Err(ValidationError::new(path.clone(), "Invalid datetime"))
                    }
                    _ => Ok(value.clone()),
                }
            }
            Schema::Array(items) => {
                let arr = match value {
                    Value::Array(a) => a,
                    other => return Err(mismatch(path, "array", other)),
                };
                let mut out = Vec::with_capacity(arr.len());
                for (i, item) in arr.iter().enumerate() {
                    path.push(i.to_string());
                    let checked = items.check_at(item, path);
                    path.pop();
                    out.push(checked?);
                }
                Ok(Value::Array(out))
            }
            Schema::Object(fields) => {
                let obj = match value {
                    Value::Object(o) => o,
                    other => return Err(mismatch(path, "object", other)),
                };
                let mut out = Map::new();
                for field in fields {
                    path.push(field.name.clone());
                    let result = match obj.get(&field.name) {
                        None | Some(Value::Null) if !field.required => Ok(None),
                        None => Err(ValidationError::new(path.clone(), "Required")),
                        Some(v) => field.schema.check_at(v, path).map(Some),
                    };
                    path.pop();
                    if let Some(v) = result? {
                        out.insert(field.name.clone(), v);
                    }
                }
                Ok(Value::Object(out))
            }
            Schema::Nullable(inner) => match value {
                Value::Null => Ok(Value::Null),
                other => inner.check_at(other, path),
            },
        }
    }
}

/// Whether a whole float converts to `i64` without saturating. The upper
/// bound is exclusive: `i64::MAX as f64` rounds up to 2^63.
fn fits_i64(f: f64) -> bool {
    f >= i64::MIN as f64 && f < -(i64::MIN as f64)
}

fn mismatch(path: &[String], expected: &str, got: &Value) -> ValidationError {
    let received = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    ValidationError::new(
        path.to_vec(),
        format!("Expected {}, received {}", expected, received),
    )
}

/// Loose structural email check: one `@`, a non-empty local part, and a
/// dotted domain with no empty labels.
fn is_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

/// The built-in validator. Stateless; share it behind an `Arc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

#[async_trait]
impl Validator for SchemaValidator {
    async fn validate(&self, schema: &Schema, raw: &Value) -> Result<Value, ValidationError> {
        schema.check(raw)
    }
}
