//! One chart per query: explodes a composite query into single-chart
//! composites while keeping every formula together with its inputs.

use crate::model::{BuilderQuery, CompositeQuery, QueryType, RawQuery};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

fn identifiers(expression: &str) -> impl Iterator<Item = &str> {
    expression
        .split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .filter(|token| {
            token
                .chars()
                .next()
                .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        })
}

/// Queries referenced by `expression`, in `query_data` order.
pub fn formula_dependencies<'a>(
    expression: &str,
    query_data: &'a [BuilderQuery],
) -> Vec<&'a BuilderQuery> {
    let tokens: HashSet<&str> = identifiers(expression).collect();
    query_data
        .iter()
        .filter(|query| tokens.contains(query.query_name.as_str()))
        .collect()
}

fn chart(template: &CompositeQuery) -> CompositeQuery {
    CompositeQuery {
        id: Some(Uuid::new_v4().to_string()),
        unit: template.unit.clone(),
        query_type: template.query_type,
        ..CompositeQuery::default()
    }
}

fn raw_charts(template: &CompositeQuery, queries: &[RawQuery]) -> Vec<CompositeQuery> {
    queries
        .iter()
        .map(|raw| {
            let mut out = chart(template);
            match template.query_type {
                QueryType::Promql => out.promql = vec![raw.clone()],
                _ => out.clickhouse_sql = vec![raw.clone()],
            }
            out
        })
        .collect()
}

/// Each standalone query and each formula (with the queries it reads)
/// becomes its own composite with a fresh id. Queries that only feed
/// formulas are not charted on their own; disabled queries still are.
pub fn split_into_one_chart_per_query(composite: &CompositeQuery) -> Vec<CompositeQuery> {
    match composite.query_type {
        QueryType::Promql => return raw_charts(composite, &composite.promql),
        QueryType::ClickhouseSql => return raw_charts(composite, &composite.clickhouse_sql),
        QueryType::Builder => {}
    }

    let builder = &composite.builder;
    if !builder.query_trace_operator.is_empty() {
        let mut single = composite.clone();
        single.id = Some(Uuid::new_v4().to_string());
        return vec![single];
    }

    let formulas: Vec<_> = builder
        .query_formulas
        .iter()
        .map(|formula| {
            (
                formula,
                formula_dependencies(&formula.expression, &builder.query_data),
            )
        })
        .collect();

    let referenced: HashSet<&str> = formulas
        .iter()
        .flat_map(|(_, deps)| deps.iter().map(|query| query.query_name.as_str()))
        .collect();

    let mut charts = Vec::with_capacity(builder.query_data.len() + formulas.len());
    for query in &builder.query_data {
        if referenced.contains(query.query_name.as_str()) {
            continue;
        }
        let mut out = chart(composite);
        out.builder.query_data = vec![query.clone()];
        charts.push(out);
    }

    for (formula, deps) in formulas {
        let mut out = chart(composite);
        out.builder.query_data = deps.into_iter().cloned().collect();
        out.builder.query_formulas = vec![formula.clone()];
        charts.push(out);
    }

    debug!(charts = charts.len(), "split composite query");
    charts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Formula, Signal};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn formula(name: &str, expression: &str) -> Formula {
        Formula {
            query_name: name.into(),
            expression: expression.into(),
            ..Formula::default()
        }
    }

    fn names(chart: &CompositeQuery) -> Vec<&str> {
        chart.query_names()
    }

    #[test]
    fn standalone_queries_get_one_chart_each() {
        let mut disabled = BuilderQuery::new("B", Signal::Logs);
        disabled.disabled = true;
        let composite = CompositeQuery::builder(
            vec![BuilderQuery::new("A", Signal::Logs), disabled],
            vec![],
        );
        let charts = split_into_one_chart_per_query(&composite);
        assert_eq!(charts.iter().map(names).collect::<Vec<_>>(), vec![vec!["A"], vec!["B"]]);
        assert!(charts[1].builder.query_data[0].disabled);
    }

    #[test]
    fn formula_travels_with_its_inputs() {
        let composite = CompositeQuery::builder(
            vec![
                BuilderQuery::new("A", Signal::Traces),
                BuilderQuery::new("B", Signal::Traces),
                BuilderQuery::new("C", Signal::Traces),
            ],
            vec![formula("F1", "A / B * 100")],
        );
        let charts = split_into_one_chart_per_query(&composite);
        assert_eq!(
            charts.iter().map(names).collect::<Vec<_>>(),
            vec![vec!["C"], vec!["A", "B", "F1"]]
        );
    }

    #[test]
    fn conservation_of_query_names() {
        let composite = CompositeQuery::builder(
            vec![
                BuilderQuery::new("A", Signal::Metrics),
                BuilderQuery::new("B", Signal::Metrics),
                BuilderQuery::new("C", Signal::Metrics),
                BuilderQuery::new("D", Signal::Metrics),
            ],
            vec![formula("F1", "sum(A,B)"), formula("F2", "B-D")],
        );
        let charts = split_into_one_chart_per_query(&composite);

        let input: BTreeSet<&str> = composite.query_names().into_iter().collect();
        let output: BTreeSet<&str> = charts.iter().flat_map(names).collect();
        assert_eq!(input, output);

        let dependencies: BTreeSet<&str> = ["A", "B", "D"].into_iter().collect();
        for name in &input {
            let appearances = charts.iter().filter(|c| names(c).contains(name)).count();
            if appearances > 1 {
                assert!(dependencies.contains(name), "{name} duplicated");
            }
        }
    }

    #[test]
    fn every_chart_has_a_fresh_id() {
        let composite = CompositeQuery::builder(
            vec![
                BuilderQuery::new("A", Signal::Logs),
                BuilderQuery::new("B", Signal::Logs),
            ],
            vec![],
        );
        let charts = split_into_one_chart_per_query(&composite);
        let ids: HashSet<_> = charts.iter().filter_map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn trace_operator_composite_stays_whole() {
        let mut composite = CompositeQuery::builder(
            vec![
                BuilderQuery::new("A", Signal::Traces),
                BuilderQuery::new("B", Signal::Traces),
            ],
            vec![],
        );
        let mut operator = BuilderQuery::new("T1", Signal::Traces);
        operator.expression = Some("A && B".into());
        composite.builder.query_trace_operator = vec![operator];

        let charts = split_into_one_chart_per_query(&composite);
        assert_eq!(charts.len(), 1);
        assert_eq!(names(&charts[0]), vec!["A", "B", "T1"]);
        assert!(charts[0].id.is_some());
    }

    #[test]
    fn promql_entries_split_individually() {
        let composite = CompositeQuery {
            query_type: QueryType::Promql,
            promql: vec![
                RawQuery {
                    name: "A".into(),
                    query: "up".into(),
                    ..RawQuery::default()
                },
                RawQuery {
                    name: "B".into(),
                    query: "rate(http_requests_total[5m])".into(),
                    ..RawQuery::default()
                },
            ],
            ..CompositeQuery::default()
        };
        let charts = split_into_one_chart_per_query(&composite);
        assert_eq!(charts.len(), 2);
        assert_eq!(charts[1].promql[0].name, "B");
    }

    #[test]
    fn identifier_tokenization_ignores_numbers_and_functions() {
        let data = vec![
            BuilderQuery::new("A", Signal::Metrics),
            BuilderQuery::new("A1", Signal::Metrics),
        ];
        let deps = formula_dependencies("sum(A1) * 100 + 2A", &data);
        assert_eq!(
            deps.iter().map(|q| q.query_name.as_str()).collect::<Vec<_>>(),
            vec!["A1"]
        );
    }
}
