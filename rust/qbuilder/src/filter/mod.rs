//! Filter expression composition.
//!
//! Base predicates (fixed per view) and caller filters (either legacy
//! `items[]` or a V5 expression string) are assembled into a [`FilterExpr`]
//! tree, field rewrites are applied over the whole tree, and the result is
//! rendered once. Rendering is deterministic: declaration order is kept and
//! quoting is fixed.

mod expr;
mod value;

pub use expr::{has_top_level_or, FieldRewrite, FilterExpr, Operator, Predicate};
pub use value::{FilterValue, Scalar};

use crate::{
    legacy::{TagFilter, TagFilterItem},
    model::Filter,
};
use tracing::debug;

/// Caller-supplied filter, in whichever shape the caller still holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum UserFilter {
    #[default]
    None,
    Items(TagFilter),
    Expression(String),
}

impl UserFilter {
    /// A non-blank V5 expression wins over legacy items.
    pub fn from_parts(expression: Option<String>, filters: Option<TagFilter>) -> Self {
        match (expression, filters) {
            (Some(expression), _) if !expression.trim().is_empty() => {
                UserFilter::Expression(expression)
            }
            (_, Some(filters)) if !filters.items.is_empty() => UserFilter::Items(filters),
            _ => UserFilter::None,
        }
    }

    pub fn to_expr(&self) -> Option<FilterExpr> {
        match self {
            UserFilter::None => None,
            UserFilter::Expression(raw) if raw.trim().is_empty() => None,
            UserFilter::Expression(raw) => Some(FilterExpr::Raw(raw.trim().to_string())),
            UserFilter::Items(filters) => items_to_expr(filters),
        }
    }
}

fn items_to_expr(filters: &TagFilter) -> Option<FilterExpr> {
    let predicates: Vec<FilterExpr> = filters
        .items
        .iter()
        .filter_map(item_to_predicate)
        .map(FilterExpr::Predicate)
        .collect();

    if predicates.is_empty() {
        return None;
    }

    if filters.op.trim().eq_ignore_ascii_case("or") {
        Some(FilterExpr::Or(predicates))
    } else {
        Some(FilterExpr::And(predicates))
    }
}

fn item_to_predicate(item: &TagFilterItem) -> Option<Predicate> {
    let key = item.key.as_ref().map(|key| key.key.trim()).unwrap_or("");
    if key.is_empty() {
        return None;
    }

    let Some(op) = Operator::parse(&item.op) else {
        debug!(key, op = %item.op, "skipping filter item with unsupported operator");
        return None;
    };

    if !op.takes_value() {
        return Some(Predicate {
            field: key.to_string(),
            op,
            value: None,
        });
    }

    match &item.value {
        Some(value) => Some(Predicate::new(key, op, value.clone())),
        None => {
            debug!(key, %op, "skipping filter item without a value");
            None
        }
    }
}

/// Joins `base` and the caller's filter with `AND`, applies `rewrites` to
/// every predicate and renders the result. Empty inputs yield `""`.
///
/// Rewrites only see structured predicates; a raw V5 expression is passed
/// through untouched.
pub fn compose(base: &[FilterExpr], user: &UserFilter, rewrites: &[FieldRewrite]) -> String {
    let mut clauses = base.to_vec();
    if let Some(user_expr) = user.to_expr() {
        clauses.push(user_expr);
    }
    FilterExpr::And(clauses).rewrite(rewrites).render()
}

/// Converts legacy `filters.items[]` into a V5 filter expression.
pub fn convert_filters_to_expression(filters: &TagFilter) -> Filter {
    let expression = items_to_expr(filters)
        .map(|expr| expr.render())
        .unwrap_or_default();
    Filter::new(expression)
}
