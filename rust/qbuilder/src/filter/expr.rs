//! A small boolean expression tree rendered to the V5 filter grammar.

use super::value::FilterValue;
use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    NotLike,
    ILike,
    NotILike,
    Contains,
    NotContains,
    Regexp,
    NotRegexp,
    Exists,
    NotExists,
    Has,
    NotHas,
    HasAny,
    HasAll,
}

impl Operator {
    /// Accepts current spellings, symbolic aliases and the deprecated
    /// short forms (`nin`, `nlike`, `nregex`, ...). Matching is
    /// case-insensitive and tolerant of `_` between words.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim()
            .to_ascii_lowercase()
            .replace('_', " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let op = match normalized.as_str() {
            "=" | "==" | "eq" => Operator::Eq,
            "!=" | "<>" | "neq" | "ne" => Operator::NotEq,
            ">" | "gt" => Operator::Gt,
            ">=" | "gte" => Operator::Gte,
            "<" | "lt" => Operator::Lt,
            "<=" | "lte" => Operator::Lte,
            "in" => Operator::In,
            "nin" | "not in" => Operator::NotIn,
            "like" => Operator::Like,
            "nlike" | "not like" => Operator::NotLike,
            "ilike" => Operator::ILike,
            "nilike" | "not ilike" => Operator::NotILike,
            "contains" => Operator::Contains,
            "ncontains" | "not contains" => Operator::NotContains,
            "regex" | "regexp" => Operator::Regexp,
            "nregex" | "nregexp" | "not regex" | "not regexp" => Operator::NotRegexp,
            "exists" => Operator::Exists,
            "nexists" | "not exists" => Operator::NotExists,
            "has" => Operator::Has,
            "nhas" | "not has" => Operator::NotHas,
            "hasany" => Operator::HasAny,
            "hasall" => Operator::HasAll,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::ILike => "ILIKE",
            Operator::NotILike => "NOT ILIKE",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT CONTAINS",
            Operator::Regexp => "REGEXP",
            Operator::NotRegexp => "NOT REGEXP",
            Operator::Exists => "EXISTS",
            Operator::NotExists => "NOT EXISTS",
            Operator::Has => "has",
            Operator::NotHas => "NOT has",
            Operator::HasAny => "hasAny",
            Operator::HasAll => "hasAll",
        }
    }

    pub fn takes_value(&self) -> bool {
        !matches!(self, Operator::Exists | Operator::NotExists)
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::HasAny | Operator::HasAll
        )
    }

    fn is_function(&self) -> bool {
        matches!(
            self,
            Operator::Has | Operator::NotHas | Operator::HasAny | Operator::HasAll
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Predicate {
    pub field: String,
    pub op: Operator,
    pub value: Option<FilterValue>,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Operator, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            op,
            value: Some(value),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, Operator::Eq, FilterValue::text(value))
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: Operator::Exists,
            value: None,
        }
    }

    fn with_field(&self, field: &str) -> Self {
        Self {
            field: field.to_string(),
            ..self.clone()
        }
    }

    pub fn render(&self) -> String {
        if !self.op.takes_value() {
            return format!("{} {}", self.field, self.op);
        }

        let value = self
            .value
            .as_ref()
            .map(|value| value.render(self.op.is_list()))
            .unwrap_or_else(|| "''".to_string());

        match self.op {
            Operator::NotHas => format!("NOT has({}, {})", self.field, value),
            op if op.is_function() => format!("{}({}, {})", op, self.field, value),
            op => format!("{} {} {}", self.field, op, value),
        }
    }
}

/// Expands every predicate on `field` into an OR over the field and its
/// alternate names, keeping the operator and value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRewrite {
    pub field: String,
    pub alternates: Vec<String>,
}

impl FieldRewrite {
    pub fn new(field: impl Into<String>, alternates: &[&str]) -> Self {
        Self {
            field: field.into(),
            alternates: alternates.iter().map(|alt| alt.to_string()).collect(),
        }
    }

    /// `http.url` is stored as `url.full` by newer semantic conventions.
    pub fn http_url() -> Self {
        Self::new("http.url", &["url.full"])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Predicate(Predicate),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    /// A caller-written V5 expression, emitted as-is.
    Raw(String),
}

impl From<Predicate> for FilterExpr {
    fn from(predicate: Predicate) -> Self {
        FilterExpr::Predicate(predicate)
    }
}

impl FilterExpr {
    /// `(fields[0] = 'v' OR fields[1] = 'v' ...)`; a single field stays a
    /// plain predicate.
    pub fn any_field_eq(fields: &[String], value: &str) -> Self {
        let mut predicates: Vec<FilterExpr> = fields
            .iter()
            .map(|field| Predicate::eq(field.as_str(), value).into())
            .collect();
        if predicates.len() == 1 {
            return predicates.remove(0);
        }
        FilterExpr::Or(predicates)
    }

    pub fn rewrite(&self, rewrites: &[FieldRewrite]) -> FilterExpr {
        match self {
            FilterExpr::Predicate(predicate) => {
                match rewrites.iter().find(|rw| rw.field == predicate.field) {
                    Some(rewrite) => {
                        let mut branches = vec![FilterExpr::Predicate(predicate.clone())];
                        branches.extend(
                            rewrite
                                .alternates
                                .iter()
                                .map(|alt| FilterExpr::Predicate(predicate.with_field(alt))),
                        );
                        FilterExpr::Or(branches)
                    }
                    None => self.clone(),
                }
            }
            FilterExpr::And(children) => {
                FilterExpr::And(children.iter().map(|c| c.rewrite(rewrites)).collect())
            }
            FilterExpr::Or(children) => {
                FilterExpr::Or(children.iter().map(|c| c.rewrite(rewrites)).collect())
            }
            FilterExpr::Raw(_) => self.clone(),
        }
    }

    pub fn render(&self) -> String {
        match self {
            FilterExpr::Predicate(predicate) => predicate.render(),
            FilterExpr::Raw(raw) => raw.trim().to_string(),
            FilterExpr::And(children) => {
                let parts: Vec<(String, bool)> = children
                    .iter()
                    .map(|child| (child.render(), child.needs_parens_in_and()))
                    .filter(|(text, _)| !text.is_empty())
                    .collect();
                if parts.len() == 1 {
                    return parts.into_iter().map(|(text, _)| text).collect();
                }
                parts
                    .into_iter()
                    .map(|(text, wrap)| if wrap { format!("({text})") } else { text })
                    .collect::<Vec<_>>()
                    .join(" AND ")
            }
            FilterExpr::Or(children) => {
                let parts: Vec<String> = children
                    .iter()
                    .map(|child| match child {
                        FilterExpr::And(_) if child.non_empty_children() > 1 => {
                            format!("({})", child.render())
                        }
                        _ => child.render(),
                    })
                    .filter(|text| !text.is_empty())
                    .collect();
                match parts.len() {
                    0 => String::new(),
                    1 => parts.into_iter().collect(),
                    _ => format!("({})", parts.join(" OR ")),
                }
            }
        }
    }

    fn non_empty_children(&self) -> usize {
        match self {
            FilterExpr::And(children) | FilterExpr::Or(children) => children
                .iter()
                .filter(|child| !child.render().is_empty())
                .count(),
            _ => usize::from(!self.render().is_empty()),
        }
    }

    fn needs_parens_in_and(&self) -> bool {
        match self {
            FilterExpr::Raw(raw) => has_top_level_or(raw),
            _ => false,
        }
    }
}

/// True when `expr` contains an `OR` keyword outside any parentheses or
/// quoted string.
pub fn has_top_level_or(expr: &str) -> bool {
    let bytes = expr.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i];
        match quote {
            Some(q) => {
                if ch == b'\\' {
                    i += 1;
                } else if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                b'\'' | b'"' => quote = Some(ch),
                b'(' => depth += 1,
                b')' => depth -= 1,
                b'o' | b'O' if depth == 0 => {
                    let before_ok = i > 0 && matches!(bytes[i - 1], b' ' | b'\t' | b'\n' | b')');
                    let is_or = bytes.get(i + 1).is_some_and(|b| b.eq_ignore_ascii_case(&b'r'));
                    let after_ok = bytes
                        .get(i + 2)
                        .is_some_and(|b| matches!(*b, b' ' | b'\t' | b'\n' | b'('));
                    if before_ok && is_or && after_ok {
                        return true;
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    false
}
