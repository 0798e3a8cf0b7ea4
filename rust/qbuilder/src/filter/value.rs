//! Filter values and their rendering inside expression strings.

use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(Number),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Scalar::Text(value.into())
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Scalar::Text(text) if text.trim().starts_with('$'))
    }

    /// Strings are single-quoted with `'` escaped; text that is already
    /// quoted and dashboard variables pass through unchanged.
    pub fn render(&self) -> String {
        match self {
            Scalar::Bool(value) => value.to_string(),
            Scalar::Number(value) => value.to_string(),
            Scalar::Text(text) if self.is_variable() => text.trim().to_string(),
            Scalar::Text(text) if is_quoted(text) => text.clone(),
            Scalar::Text(text) => format!("'{}'", text.replace('\'', "\\'")),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(value) => write!(f, "{value}"),
            Scalar::Number(value) => write!(f, "{value}"),
            Scalar::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(value.into())
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

impl FilterValue {
    pub fn text(value: impl Into<String>) -> Self {
        FilterValue::Scalar(Scalar::Text(value.into()))
    }

    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        FilterValue::List(values.into_iter().map(Into::into).collect())
    }

    fn items(&self) -> &[Scalar] {
        match self {
            FilterValue::Scalar(value) => std::slice::from_ref(value),
            FilterValue::List(values) => values,
        }
    }

    /// Renders the value for an operator. List operators always get a
    /// bracketed list, even for a single scalar; a list holding a single
    /// dashboard variable renders as the bare variable.
    pub fn render(&self, as_list: bool) -> String {
        match self {
            FilterValue::Scalar(value) if !as_list || value.is_variable() => value.render(),
            FilterValue::List(values) if values.len() == 1 && values[0].is_variable() => {
                values[0].render()
            }
            _ => {
                let rendered: Vec<String> = self.items().iter().map(Scalar::render).collect();
                format!("[{}]", rendered.join(", "))
            }
        }
    }
}

fn is_quoted(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= 2
        && matches!(bytes[0], b'\'' | b'"')
        && bytes[bytes.len() - 1] == bytes[0]
}
