//! Aggregation mapping: legacy operator/attribute pairs to V5 aggregation
//! lists, alias extraction and aggregation labels.

use crate::{
    error::{Result, ServiceError},
    model::{Aggregation, BuilderQuery, ExpressionAggregation, MetricAggregation, Signal},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOperator {
    Noop,
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    P05,
    P10,
    P20,
    P25,
    P50,
    P75,
    P90,
    P95,
    P99,
    Rate,
    RateSum,
    RateAvg,
    RateMin,
    RateMax,
}

impl AggregateOperator {
    pub fn parse(raw: &str) -> Result<Self> {
        let op = match raw.trim().to_ascii_lowercase().as_str() {
            "noop" => AggregateOperator::Noop,
            "count" => AggregateOperator::Count,
            "count_distinct" | "countdistinct" => AggregateOperator::CountDistinct,
            "sum" => AggregateOperator::Sum,
            "avg" => AggregateOperator::Avg,
            "min" => AggregateOperator::Min,
            "max" => AggregateOperator::Max,
            "p05" => AggregateOperator::P05,
            "p10" => AggregateOperator::P10,
            "p20" => AggregateOperator::P20,
            "p25" => AggregateOperator::P25,
            "p50" => AggregateOperator::P50,
            "p75" => AggregateOperator::P75,
            "p90" => AggregateOperator::P90,
            "p95" => AggregateOperator::P95,
            "p99" => AggregateOperator::P99,
            "rate" => AggregateOperator::Rate,
            "rate_sum" => AggregateOperator::RateSum,
            "rate_avg" => AggregateOperator::RateAvg,
            "rate_min" => AggregateOperator::RateMin,
            "rate_max" => AggregateOperator::RateMax,
            other => {
                return Err(ServiceError::InvalidRequest(format!(
                    "unsupported aggregate operator '{other}'"
                )))
            }
        };
        Ok(op)
    }

    /// Spelling used inside V5 aggregation expressions.
    pub fn function_name(&self) -> &'static str {
        match self {
            AggregateOperator::Noop | AggregateOperator::Count => "count",
            AggregateOperator::CountDistinct => "countDistinct",
            AggregateOperator::Sum => "sum",
            AggregateOperator::Avg => "avg",
            AggregateOperator::Min => "min",
            AggregateOperator::Max => "max",
            AggregateOperator::P05 => "p05",
            AggregateOperator::P10 => "p10",
            AggregateOperator::P20 => "p20",
            AggregateOperator::P25 => "p25",
            AggregateOperator::P50 => "p50",
            AggregateOperator::P75 => "p75",
            AggregateOperator::P90 => "p90",
            AggregateOperator::P95 => "p95",
            AggregateOperator::P99 => "p99",
            AggregateOperator::Rate => "rate",
            AggregateOperator::RateSum => "rate_sum",
            AggregateOperator::RateAvg => "rate_avg",
            AggregateOperator::RateMin => "rate_min",
            AggregateOperator::RateMax => "rate_max",
        }
    }

    fn requires_attribute(&self) -> bool {
        !matches!(
            self,
            AggregateOperator::Noop | AggregateOperator::Count | AggregateOperator::Rate
        )
    }
}

impl fmt::Display for AggregateOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function_name())
    }
}

/// V5 aggregations produced from one legacy operator/attribute pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedAggregation {
    pub aggregations: Vec<Aggregation>,
    /// `Some("rate")` when the operator is a rate over time.
    pub time_aggregation: Option<String>,
}

impl MappedAggregation {
    /// Writes the mapping onto `query`. A rate marker clears `stepInterval`
    /// so the backend picks the resolution.
    pub fn apply(self, mut query: BuilderQuery) -> BuilderQuery {
        query.aggregations = self.aggregations;
        if let Some(marker) = self.time_aggregation {
            query.time_aggregation = Some(marker);
            query.step_interval = None;
        }
        query
    }
}

pub fn map_aggregation(operator: &str, attribute: Option<&str>) -> Result<MappedAggregation> {
    let op = AggregateOperator::parse(operator)?;
    let attribute = attribute.map(str::trim).filter(|attr| !attr.is_empty());

    let expression = match attribute {
        _ if op == AggregateOperator::Rate => "rate()".to_string(),
        Some(attr) => format!("{}({attr})", op.function_name()),
        None if !op.requires_attribute() => "count()".to_string(),
        None => {
            return Err(ServiceError::InvalidRequest(format!(
                "aggregate operator '{op}' requires an attribute"
            )))
        }
    };

    Ok(MappedAggregation {
        aggregations: vec![Aggregation::expression(expression)],
        time_aggregation: (op == AggregateOperator::Rate).then(|| "rate".to_string()),
    })
}

fn normalize_noop(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            if value.eq_ignore_ascii_case("noop") {
                "count".to_string()
            } else {
                value.to_string()
            }
        })
}

/// Legacy metric fields folded into one metric aggregation. Missing
/// time/space aggregations fall back to the operator; `noop` becomes `count`.
#[derive(Debug, Clone, Default)]
pub struct LegacyMetric<'a> {
    pub operator: Option<&'a str>,
    pub metric_name: Option<&'a str>,
    pub time_aggregation: Option<&'a str>,
    pub space_aggregation: Option<&'a str>,
    pub reduce_to: Option<&'a str>,
    pub temporality: Option<&'a str>,
}

impl LegacyMetric<'_> {
    pub fn into_aggregation(self) -> Aggregation {
        let operator = normalize_noop(self.operator);
        Aggregation::Metric(MetricAggregation {
            metric_name: self.metric_name.unwrap_or_default().trim().to_string(),
            temporality: self
                .temporality
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string),
            time_aggregation: normalize_noop(self.time_aggregation).or_else(|| operator.clone()),
            space_aggregation: normalize_noop(self.space_aggregation).or(operator),
            reduce_to: self
                .reduce_to
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string),
        })
    }
}

/// Fills blank metric aggregation fields from the query-level legacy
/// fields; `reduceTo` defaults to `avg`.
pub fn fill_metric_aggregation(
    aggregation: &MetricAggregation,
    query: &BuilderQuery,
    legacy_metric_name: Option<&str>,
) -> MetricAggregation {
    fn pick(primary: &Option<String>, fallback: &Option<String>) -> Option<String> {
        primary
            .as_ref()
            .filter(|value| !value.trim().is_empty())
            .or(fallback.as_ref().filter(|value| !value.trim().is_empty()))
            .cloned()
    }

    let metric_name = if aggregation.metric_name.trim().is_empty() {
        legacy_metric_name.unwrap_or_default().to_string()
    } else {
        aggregation.metric_name.clone()
    };

    MetricAggregation {
        metric_name,
        temporality: pick(&aggregation.temporality, &query.temporality),
        time_aggregation: pick(&aggregation.time_aggregation, &query.time_aggregation),
        space_aggregation: pick(&aggregation.space_aggregation, &query.space_aggregation),
        reduce_to: pick(&aggregation.reduce_to, &query.reduce_to).or(Some("avg".to_string())),
    }
}

#[allow(clippy::expect_used)]
static AGGREGATION_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z0-9_]+\([^)]*\))(?:\s*(?i:as)\s+('[^']*'|"[^"]*"|[a-zA-Z0-9_-]+))?"#)
        .expect("aggregation call pattern is a valid regex")
});

/// Splits an aggregation expression into its calls. `count() as 'cnt'
/// avg(code.lineno)` yields two aggregations, the first aliased `cnt`.
/// `fallback_alias` applies to calls without their own alias. Text that
/// contains no call yields nothing.
pub fn parse_aggregations(expression: &str, fallback_alias: Option<&str>) -> Vec<ExpressionAggregation> {
    AGGREGATION_CALL
        .captures_iter(expression)
        .filter_map(|caps| {
            let call = caps.get(1)?.as_str().to_string();
            let alias = caps
                .get(2)
                .map(|m| strip_quotes(m.as_str()))
                .or(fallback_alias)
                .filter(|alias| !alias.is_empty())
                .map(str::to_string);
            Some(ExpressionAggregation {
                expression: call,
                alias,
            })
        })
        .collect()
}

fn strip_quotes(alias: &str) -> &str {
    alias.trim_matches(|ch| ch == '\'' || ch == '"')
}

/// The effective expression aggregations of a logs/traces query: every
/// declared aggregation is re-parsed for aliases, and anything that parses
/// to nothing becomes `count()`.
pub fn expression_aggregations(query: &BuilderQuery) -> Vec<ExpressionAggregation> {
    let declared: Vec<&ExpressionAggregation> = query
        .aggregations
        .iter()
        .filter_map(|agg| match agg {
            Aggregation::Expression(expr) => Some(expr),
            Aggregation::Metric(_) => None,
        })
        .collect();

    if declared.is_empty() {
        return vec![count_all()];
    }

    declared
        .into_iter()
        .flat_map(|agg| {
            let parsed = parse_aggregations(&agg.expression, agg.alias.as_deref());
            if parsed.is_empty() {
                vec![count_all()]
            } else {
                parsed
            }
        })
        .collect()
}

fn count_all() -> ExpressionAggregation {
    ExpressionAggregation {
        expression: "count()".to_string(),
        alias: None,
    }
}

/// What a result series can be labelled with for one aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationLabel {
    pub expression: Option<String>,
    pub alias: Option<String>,
}

impl AggregationLabel {
    pub fn alias_or_expression(&self) -> Option<&str> {
        self.alias.as_deref().or(self.expression.as_deref())
    }
}

/// Labels for each aggregation of `query`, in declaration order. Metric
/// queries always expose one unlabelled aggregation.
pub fn aggregation_labels(query: &BuilderQuery) -> Vec<AggregationLabel> {
    match query.data_source {
        Signal::Metrics => vec![AggregationLabel::default()],
        Signal::Logs | Signal::Traces => expression_aggregations(query)
            .into_iter()
            .map(|agg| AggregationLabel {
                expression: Some(agg.expression),
                alias: agg.alias,
            })
            .collect(),
    }
}

/// Legacy `having` items joined with ` AND `; list values render as
/// `[a, b]`, everything else verbatim.
pub fn convert_having_to_expression(items: &[crate::legacy::LegacyHaving]) -> String {
    items
        .iter()
        .filter(|item| !item.column_name.trim().is_empty())
        .map(|item| {
            let value = match &item.value {
                serde_json::Value::Array(values) => format!(
                    "[{}]",
                    values.iter().map(plain_value).collect::<Vec<_>>().join(", ")
                ),
                other => plain_value(other),
            };
            format!("{} {} {}", item.column_name, item.op, value)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn plain_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::LegacyHaving;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn expressions(mapped: &MappedAggregation) -> Vec<&str> {
        mapped
            .aggregations
            .iter()
            .filter_map(Aggregation::expression_text)
            .collect()
    }

    #[test]
    fn count_with_and_without_attribute() {
        assert_eq!(expressions(&map_aggregation("count", None).unwrap()), ["count()"]);
        assert_eq!(expressions(&map_aggregation("count", Some("")).unwrap()), ["count()"]);
        assert_eq!(
            expressions(&map_aggregation("count", Some("span_id")).unwrap()),
            ["count(span_id)"]
        );
        assert_eq!(expressions(&map_aggregation("noop", None).unwrap()), ["count()"]);
        assert_eq!(
            expressions(&map_aggregation("count_distinct", Some("user.id")).unwrap()),
            ["countDistinct(user.id)"]
        );
    }

    #[test]
    fn percentiles_and_basic_operators() {
        for (op, expected) in [
            ("p50", "p50(duration_nano)"),
            ("p90", "p90(duration_nano)"),
            ("p95", "p95(duration_nano)"),
            ("p99", "p99(duration_nano)"),
            ("max", "max(duration_nano)"),
            ("min", "min(duration_nano)"),
            ("sum", "sum(duration_nano)"),
            ("avg", "avg(duration_nano)"),
            ("rate_sum", "rate_sum(duration_nano)"),
        ] {
            let mapped = map_aggregation(op, Some("duration_nano")).unwrap();
            assert_eq!(expressions(&mapped), [expected]);
            assert_eq!(mapped.time_aggregation, None);
        }
    }

    #[test]
    fn rate_sets_marker_and_clears_step_interval() {
        let mapped = map_aggregation("rate", None).unwrap();
        assert_eq!(mapped.time_aggregation.as_deref(), Some("rate"));

        let mut query = BuilderQuery::new("A", Signal::Traces);
        query.step_interval = Some(60);
        let query = mapped.apply(query);
        assert_eq!(query.step_interval, None);
        assert_eq!(query.time_aggregation.as_deref(), Some("rate"));

        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["stepInterval"], serde_json::Value::Null);
        assert!(value.get("aggregateAttribute").is_none());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = map_aggregation("median", Some("x")).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert!(map_aggregation("sum", None).is_err());
    }

    #[test]
    fn parses_multiple_calls_with_aliases() {
        let parsed = parse_aggregations("count() as 'cnt' avg(code.lineno) ", None);
        assert_eq!(
            parsed,
            vec![
                ExpressionAggregation {
                    expression: "count()".into(),
                    alias: Some("cnt".into()),
                },
                ExpressionAggregation {
                    expression: "avg(code.lineno)".into(),
                    alias: None,
                },
            ]
        );

        let parsed = parse_aggregations("sum(bytes) AS \"total\", p99(duration_nano) as p99-latency", None);
        assert_eq!(parsed[0].alias.as_deref(), Some("total"));
        assert_eq!(parsed[1].alias.as_deref(), Some("p99-latency"));
    }

    #[test]
    fn malformed_aliases_are_not_errors() {
        let parsed = parse_aggregations("count() as", None);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].alias, None);
        assert!(parse_aggregations("not an aggregation", None).is_empty());
        let parsed = parse_aggregations("count()", Some("fallback"));
        assert_eq!(parsed[0].alias.as_deref(), Some("fallback"));
    }

    #[test]
    fn unparseable_aggregations_become_count() {
        let query: BuilderQuery = serde_json::from_value(json!({
            "queryName": "A",
            "dataSource": "logs",
            "aggregations": [{ "expression": "garbage" }]
        }))
        .unwrap();
        let labels = aggregation_labels(&query);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].expression.as_deref(), Some("count()"));

        let empty = BuilderQuery::new("B", Signal::Traces);
        assert_eq!(expression_aggregations(&empty), vec![count_all()]);
    }

    #[test]
    fn legacy_metric_folds_noop_into_count() {
        let agg = LegacyMetric {
            operator: Some("noop"),
            metric_name: Some("signoz_calls_total"),
            time_aggregation: None,
            space_aggregation: Some("sum"),
            ..LegacyMetric::default()
        }
        .into_aggregation();
        assert_eq!(
            agg,
            Aggregation::Metric(MetricAggregation {
                metric_name: "signoz_calls_total".into(),
                temporality: None,
                time_aggregation: Some("count".into()),
                space_aggregation: Some("sum".into()),
                reduce_to: None,
            })
        );
    }

    #[test]
    fn fills_metric_aggregation_from_query_fields() {
        let mut query = BuilderQuery::new("A", Signal::Metrics);
        query.time_aggregation = Some("rate".into());
        query.space_aggregation = Some("sum".into());
        let filled = fill_metric_aggregation(&MetricAggregation::default(), &query, Some("calls"));
        assert_eq!(filled.metric_name, "calls");
        assert_eq!(filled.time_aggregation.as_deref(), Some("rate"));
        assert_eq!(filled.space_aggregation.as_deref(), Some("sum"));
        assert_eq!(filled.reduce_to.as_deref(), Some("avg"));
    }

    #[test]
    fn having_items_join_with_and() {
        let items = vec![
            LegacyHaving {
                column_name: "count()".into(),
                op: ">".into(),
                value: json!(10),
            },
            LegacyHaving {
                column_name: "code".into(),
                op: "IN".into(),
                value: json!([200, "ok"]),
            },
            LegacyHaving {
                column_name: "".into(),
                op: "=".into(),
                value: json!(1),
            },
        ];
        assert_eq!(
            convert_having_to_expression(&items),
            "count() > 10 AND code IN [200, ok]"
        );
    }
}
