//! Series label resolution.
//!
//! Precedence, first match wins:
//! 1. non-builder queries keep the backend label;
//! 2. the owning query is the trace operator when one exists, else the
//!    query or formula named by the series;
//! 3. an `as '<alias>'` on the selected aggregation is the alias;
//! 4. without an alias, a user legend on the owner is returned verbatim;
//! 5. a lone query returns the alias (ungrouped), the backend label (grouped,
//!    one aggregation) or `<alias-or-expression>-<label>` (grouped, several);
//! 6. composite charts always qualify as `<alias-or-expression>-<label>`.

use crate::{
    aggregation::{aggregation_labels, AggregationLabel},
    model::{BuilderQuery, CompositeQuery, Formula, QueryType, ResultSeries},
};
use serde::Serialize;

enum Owner<'a> {
    Query(&'a BuilderQuery),
    Formula(&'a Formula),
}

impl Owner<'_> {
    fn labels(&self) -> Vec<AggregationLabel> {
        match self {
            Owner::Query(query) => aggregation_labels(query),
            Owner::Formula(_) => vec![AggregationLabel::default()],
        }
    }

    fn legend(&self) -> Option<&str> {
        match self {
            Owner::Query(query) => query.legend_text(),
            Owner::Formula(formula) => formula.legend_text(),
        }
    }

    fn is_grouped(&self) -> bool {
        match self {
            Owner::Query(query) => !query.group_by.is_empty(),
            Owner::Formula(_) => false,
        }
    }
}

fn series_query_name(series: &ResultSeries) -> &str {
    series
        .meta_data
        .as_ref()
        .and_then(|meta| meta.query_name.as_deref())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(series.query_name.as_str())
}

fn resolve_owner<'a>(query: &'a CompositeQuery, name: &str) -> Option<Owner<'a>> {
    let builder = &query.builder;
    if let Some(trace_operator) = builder.query_trace_operator.first() {
        return Some(Owner::Query(trace_operator));
    }
    builder
        .query_data
        .iter()
        .find(|q| q.query_name == name)
        .map(Owner::Query)
        .or_else(|| {
            builder
                .query_formulas
                .iter()
                .find(|f| f.query_name == name)
                .map(Owner::Formula)
        })
}

/// Picks the aggregation a series came from: `metaData.index` when the
/// owner has several, else the one whose alias matches `metaData.alias`,
/// else the first.
fn select_label(labels: Vec<AggregationLabel>, series: &ResultSeries) -> AggregationLabel {
    let meta = series.meta_data.as_ref();
    let by_index = meta
        .and_then(|meta| meta.index)
        .filter(|index| labels.len() > 1 && *index < labels.len());
    let by_alias = || {
        let wanted = meta.and_then(|meta| meta.alias.as_deref())?;
        labels
            .iter()
            .position(|label| label.alias.as_deref() == Some(wanted))
    };

    let position = by_index.or_else(by_alias).unwrap_or(0);
    labels.into_iter().nth(position).unwrap_or_default()
}

fn total_queries(query: &CompositeQuery) -> usize {
    let builder = &query.builder;
    if builder.query_trace_operator.is_empty() {
        builder.query_data.len() + builder.query_formulas.len()
    } else {
        builder.query_trace_operator.len()
    }
}

fn qualify(prefix: Option<&str>, query_name: &str, fallback: &str) -> String {
    let prefix = prefix
        .filter(|prefix| !prefix.is_empty())
        .or(Some(query_name).filter(|name| !name.is_empty()));
    match prefix {
        Some(prefix) => format!("{prefix}-{fallback}"),
        None => fallback.to_string(),
    }
}

pub fn get_legend(series: &ResultSeries, query: &CompositeQuery, fallback: &str) -> String {
    if query.query_type != QueryType::Builder {
        return fallback.to_string();
    }

    let name = series_query_name(series);
    let Some(owner) = resolve_owner(query, name) else {
        return fallback.to_string();
    };

    let labels = owner.labels();
    let aggregation_count = labels.len();
    let selected = select_label(labels, series);
    let alias = selected.alias.as_deref().filter(|alias| !alias.is_empty());

    if alias.is_none() {
        if let Some(legend) = owner.legend() {
            return legend.to_string();
        }
    }

    if total_queries(query) <= 1 {
        if !owner.is_grouped() {
            return alias.unwrap_or(fallback).to_string();
        }
        if aggregation_count == 1 {
            return fallback.to_string();
        }
    }

    qualify(selected.alias_or_expression(), name, fallback)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryLabel {
    pub label: String,
    pub value: String,
}

/// Column picker entries: one per query, or one per aggregation
/// (`A.0`, `A.1`, ...) for queries with several aggregations.
pub fn query_labels_with_aggregation(query_data: &[BuilderQuery]) -> Vec<QueryLabel> {
    query_data
        .iter()
        .filter(|query| !query.query_name.is_empty() && !query.aggregations.is_empty())
        .flat_map(|query| {
            let labels = aggregation_labels(query);
            let multiple = labels.len() > 1;
            let name = query.query_name.as_str();
            labels
                .into_iter()
                .enumerate()
                .map(move |(index, label)| {
                    if !multiple {
                        return QueryLabel {
                            label: name.to_string(),
                            value: name.to_string(),
                        };
                    }
                    let value = match label.expression {
                        Some(expression) => format!("{name}.{expression}"),
                        None => name.to_string(),
                    };
                    QueryLabel {
                        label: format!("{name}.{index}"),
                        value,
                    }
                })
        })
        .collect()
}
