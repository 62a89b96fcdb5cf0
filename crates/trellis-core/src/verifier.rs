//! Input verification: sanitization, type coercion and validation.
//!
//! A [`Verifier`] declares the fields it accepts. Calling it on a mapping of
//! raw values:
//!
//! 1. drops every key that is not declared,
//! 2. checks that required fields are present and not null,
//! 3. coerces typed fields to their [`FieldType`],
//! 4. runs every validation of every present field and collects the
//!    failure messages.
//!
//! Verification failures are values, not errors: the caller inspects
//! [`Verification::is_verified`] and [`Verification::messages`].
//!
//! ```
//! use trellis_core::value::{FieldType, Value};
//! use trellis_core::values;
//! use trellis_core::verifier::{Field, Validation, Verifier};
//!
//! let verifier = Verifier::new()
//!     .field(Field::required("title").typed(FieldType::String).validate(Validation::Presence))
//!     .field(Field::optional("published_at").typed(FieldType::Datetime));
//!
//! let result = verifier.call(&values! { "title" => "", "extra" => 1 });
//! assert!(!result.is_verified());
//! assert_eq!(result.messages()["title"], vec!["cannot be blank"]);
//! assert!(!result.values().contains_key("extra"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use validator::{ValidateEmail, ValidateLength, ValidateUrl};

use crate::value::{FieldType, Value, Values};

/// Message for a required field that is missing or null.
pub const REQUIRED_MESSAGE: &str = "is required";

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A check applied to a present field value.
#[derive(Clone)]
pub enum Validation {
    /// Not blank: not null, not an empty or whitespace-only string, not an
    /// empty list or map.
    Presence,
    /// Length bounds on strings (characters) and lists (elements).
    Length {
        /// Inclusive lower bound.
        min: Option<u64>,
        /// Inclusive upper bound.
        max: Option<u64>,
    },
    /// A syntactically valid email address.
    Email,
    /// A syntactically valid absolute URL.
    Url,
    /// A caller-supplied predicate.
    Custom(Predicate),
}

impl fmt::Debug for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presence => f.write_str("Presence"),
            Self::Length { min, max } => f
                .debug_struct("Length")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::Email => f.write_str("Email"),
            Self::Url => f.write_str("Url"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Validation {
    /// Wrap a predicate as a validation.
    pub fn custom(predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    fn passes(&self, value: &Value) -> bool {
        match self {
            Self::Presence => !value.is_blank(),
            Self::Length { min, max } => match value {
                Value::String(s) => s.validate_length(*min, *max, None),
                Value::List(items) => items.validate_length(*min, *max, None),
                _ => false,
            },
            Self::Email => matches!(value, Value::String(s) if s.validate_email()),
            Self::Url => matches!(value, Value::String(s) if s.validate_url()),
            Self::Custom(predicate) => predicate(value),
        }
    }

    fn default_message(&self) -> String {
        match self {
            Self::Presence => "cannot be blank".to_owned(),
            Self::Length { min, max } => match (min, max) {
                (Some(min), Some(max)) => format!("must be between {min} and {max} long"),
                (Some(min), None) => format!("must be at least {min} long"),
                (None, Some(max)) => format!("must be at most {max} long"),
                (None, None) => "has an invalid length".to_owned(),
            },
            Self::Email => "is not a valid email".to_owned(),
            Self::Url => "is not a valid url".to_owned(),
            Self::Custom(_) => "is invalid".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
struct Check {
    validation: Validation,
    message: Option<String>,
}

/// One declared field.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    required: bool,
    field_type: Option<FieldType>,
    required_message: Option<String>,
    checks: Vec<Check>,
    group: Option<Verifier>,
}

impl Field {
    fn new(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            required,
            field_type: None,
            required_message: None,
            checks: Vec::new(),
            group: None,
        }
    }

    /// A field that must be present and not null.
    pub fn required(name: impl Into<String>) -> Self {
        Self::new(name, true)
    }

    /// A field that may be absent.
    pub fn optional(name: impl Into<String>) -> Self {
        Self::new(name, false)
    }

    /// A required nested mapping verified by `verifier`. Nested failures are
    /// reported as `field.child`.
    pub fn required_group(name: impl Into<String>, verifier: Verifier) -> Self {
        Self::new(name, true).group(verifier)
    }

    /// An optional nested mapping verified by `verifier` when present.
    pub fn optional_group(name: impl Into<String>, verifier: Verifier) -> Self {
        Self::new(name, false).group(verifier)
    }

    /// Coerce the value to `field_type`.
    #[must_use]
    pub const fn typed(mut self, field_type: FieldType) -> Self {
        self.field_type = Some(field_type);
        self
    }

    /// Replace the "is required" message.
    #[must_use]
    pub fn required_message(mut self, message: impl Into<String>) -> Self {
        self.required_message = Some(message.into());
        self
    }

    /// Add a validation with its default message.
    #[must_use]
    pub fn validate(mut self, validation: Validation) -> Self {
        self.checks.push(Check {
            validation,
            message: None,
        });
        self
    }

    /// Add a validation with a custom failure message.
    #[must_use]
    pub fn validate_with_message(mut self, validation: Validation, message: impl Into<String>) -> Self {
        self.checks.push(Check {
            validation,
            message: Some(message.into()),
        });
        self
    }

    fn group(mut self, verifier: Verifier) -> Self {
        self.group = Some(verifier);
        self
    }
}

/// The outcome of running a [`Verifier`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verification {
    values: Values,
    messages: BTreeMap<String, Vec<String>>,
}

impl Verification {
    /// True when no field failed.
    pub fn is_verified(&self) -> bool {
        self.messages.is_empty()
    }

    /// The sanitized and coerced values.
    pub const fn values(&self) -> &Values {
        &self.values
    }

    /// Take the sanitized values.
    pub fn into_values(self) -> Values {
        self.values
    }

    /// Failure messages per field. Fields without failures are absent.
    pub const fn messages(&self) -> &BTreeMap<String, Vec<String>> {
        &self.messages
    }

    fn fail(&mut self, field: &str, message: String) {
        self.messages.entry(field.to_owned()).or_default().push(message);
    }
}

/// A declared set of fields.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    fields: Vec<Field>,
}

impl Verifier {
    /// An empty verifier, which strips every key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Verify `input`.
    pub fn call(&self, input: &Values) -> Verification {
        let mut result = Verification::default();

        for field in &self.fields {
            let raw = match input.get(&field.name) {
                None => {
                    if field.required {
                        result.fail(&field.name, required_message(field));
                    }
                    continue;
                }
                Some(Value::Null) => {
                    if field.required {
                        result.fail(&field.name, required_message(field));
                    }
                    result.values.insert(field.name.clone(), Value::Null);
                    continue;
                }
                Some(raw) => raw.clone(),
            };

            let value = match field.field_type.map(|t| t.coerce(raw.clone())) {
                None => raw,
                Some(Ok(coerced)) => coerced,
                Some(Err(e)) => {
                    result.fail(&field.name, e.to_string());
                    result.values.insert(field.name.clone(), raw);
                    continue;
                }
            };

            let value = match (&field.group, value) {
                (Some(group), Value::Map(map)) => {
                    let nested = group.call(&map);
                    for (child, messages) in nested.messages {
                        let key = format!("{}.{child}", field.name);
                        result.messages.entry(key).or_default().extend(messages);
                    }
                    Value::Map(nested.values)
                }
                (Some(_), other) => {
                    result.fail(&field.name, "is not a valid group".to_owned());
                    other
                }
                (None, value) => value,
            };

            for check in &field.checks {
                if !check.validation.passes(&value) {
                    let message = check
                        .message
                        .clone()
                        .unwrap_or_else(|| check.validation.default_message());
                    result.fail(&field.name, message);
                }
            }

            result.values.insert(field.name.clone(), value);
        }

        result
    }
}

fn required_message(field: &Field) -> String {
    field
        .required_message
        .clone()
        .unwrap_or_else(|| REQUIRED_MESSAGE.to_owned())
}
