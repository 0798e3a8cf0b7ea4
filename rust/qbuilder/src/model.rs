//! Query descriptor shapes shared by every composer.
//!
//! Everything here is the current (V5-era) builder shape. Legacy V4 input is
//! accepted only through [`crate::legacy::BuilderQueryInput`], which the
//! `queryData`/`queryTraceOperator` deserializers run before a value ever
//! reaches this module, so composers only see one shape.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::{BTreeMap, HashSet};

/// Legacy payloads send `null` for unset string fields.
pub(crate) fn nullable_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    #[default]
    Metrics,
    Logs,
    Traces,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
            Signal::Traces => "traces",
        }
    }

    /// Lenient lookup: unknown data sources resolve to metrics.
    pub fn from_data_source(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "logs" => Signal::Logs,
            "traces" => Signal::Traces,
            _ => Signal::Metrics,
        }
    }
}

impl<'de> Deserialize<'de> for Signal {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .map(Signal::from_data_source)
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    Builder,
    ClickhouseSql,
    Promql,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// A grouping column. Identity is `key` + `field_type`: the same name may
/// exist both as a resource and as an attribute field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupByKey {
    #[serde(alias = "name")]
    pub key: String,
    #[serde(default, alias = "fieldDataType", deserialize_with = "nullable_string")]
    pub data_type: String,
    #[serde(
        default,
        rename = "type",
        alias = "fieldContext",
        deserialize_with = "nullable_string"
    )]
    pub field_type: String,
}

impl GroupByKey {
    pub fn new(key: impl Into<String>, data_type: &str, field_type: &str) -> Self {
        Self {
            key: key.into(),
            data_type: data_type.to_string(),
            field_type: field_type.to_string(),
        }
    }

    pub fn same_field(&self, other: &GroupByKey) -> bool {
        self.key == other.key && self.field_type == other.field_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub column_name: String,
    #[serde(default)]
    pub order: Direction,
}

impl OrderBy {
    pub fn new(column_name: impl Into<String>, order: Direction) -> Self {
        Self {
            column_name: column_name.into(),
            order,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub expression: String,
}

impl Filter {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.expression.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Having {
    #[serde(default)]
    pub expression: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionAggregation {
    pub expression: String,
    #[serde(default)]
    pub alias: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricAggregation {
    pub metric_name: String,
    #[serde(default)]
    pub temporality: Option<String>,
    #[serde(default)]
    pub time_aggregation: Option<String>,
    #[serde(default)]
    pub space_aggregation: Option<String>,
    #[serde(default)]
    pub reduce_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Aggregation {
    Expression(ExpressionAggregation),
    Metric(MetricAggregation),
}

impl Aggregation {
    pub fn expression(expression: impl Into<String>) -> Self {
        Aggregation::Expression(ExpressionAggregation {
            expression: expression.into(),
            alias: None,
        })
    }

    pub fn expression_text(&self) -> Option<&str> {
        match self {
            Aggregation::Expression(agg) => Some(agg.expression.as_str()),
            Aggregation::Metric(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionArg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFunction {
    pub name: String,
    #[serde(default)]
    pub args: Vec<FunctionArg>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named_args: BTreeMap<String, Value>,
}

/// A field reference used by `selectColumns`.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldKey {
    #[serde(alias = "key")]
    pub name: String,
    #[serde(default, alias = "dataType")]
    pub field_data_type: Option<String>,
    #[serde(default, alias = "type")]
    pub field_context: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderQuery {
    pub query_name: String,
    #[serde(default)]
    pub data_source: Signal,
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub group_by: Vec<GroupByKey>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub having: Option<Having>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serialize_always]
    #[serde(default)]
    pub step_interval: Option<i64>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub legend: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub functions: Vec<QueryFunction>,
    #[serde(default)]
    pub select_columns: Vec<FieldKey>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub time_aggregation: Option<String>,
    #[serde(default)]
    pub space_aggregation: Option<String>,
    #[serde(default)]
    pub reduce_to: Option<String>,
    #[serde(default)]
    pub temporality: Option<String>,
}

impl BuilderQuery {
    pub fn new(query_name: impl Into<String>, data_source: Signal) -> Self {
        Self {
            query_name: query_name.into(),
            data_source,
            ..Self::default()
        }
    }

    pub fn filter_expression(&self) -> &str {
        self.filter
            .as_ref()
            .map(|filter| filter.expression.as_str())
            .unwrap_or("")
    }

    pub fn legend_text(&self) -> Option<&str> {
        self.legend
            .as_deref()
            .filter(|legend| !legend.trim().is_empty())
    }
}

/// Trace operators share the builder query shape; `expression` joins other
/// query names with `&&` / `||`.
pub type TraceOperator = BuilderQuery;

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Formula {
    pub query_name: String,
    pub expression: String,
    #[serde(default)]
    pub legend: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub having: Option<Having>,
}

impl Formula {
    pub fn legend_text(&self) -> Option<&str> {
        self.legend
            .as_deref()
            .filter(|legend| !legend.trim().is_empty())
    }
}

/// A PromQL or ClickHouse SQL entry; both carry a raw query string.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuery {
    pub name: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub legend: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// PromQL resolution in seconds.
    #[serde(default)]
    pub step_interval: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderSection {
    #[serde(default, deserialize_with = "crate::legacy::deserialize_queries")]
    pub query_data: Vec<BuilderQuery>,
    #[serde(default)]
    pub query_formulas: Vec<Formula>,
    #[serde(default, deserialize_with = "crate::legacy::deserialize_queries")]
    pub query_trace_operator: Vec<TraceOperator>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeQuery {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default)]
    pub builder: BuilderSection,
    #[serde(default)]
    pub promql: Vec<RawQuery>,
    #[serde(default, rename = "clickhouse_sql")]
    pub clickhouse_sql: Vec<RawQuery>,
}

impl CompositeQuery {
    pub fn builder(query_data: Vec<BuilderQuery>, query_formulas: Vec<Formula>) -> Self {
        Self {
            builder: BuilderSection {
                query_data,
                query_formulas,
                query_trace_operator: Vec::new(),
            },
            ..Self::default()
        }
    }

    /// Every name declared by `queryData`, `queryFormulas` and
    /// `queryTraceOperator`, in that order.
    pub fn query_names(&self) -> Vec<&str> {
        self.builder
            .query_data
            .iter()
            .map(|query| query.query_name.as_str())
            .chain(
                self.builder
                    .query_formulas
                    .iter()
                    .map(|formula| formula.query_name.as_str()),
            )
            .chain(
                self.builder
                    .query_trace_operator
                    .iter()
                    .map(|op| op.query_name.as_str()),
            )
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for name in self.query_names() {
            if name.trim().is_empty() {
                return Err(ServiceError::invalid("query name must not be empty"));
            }
            if !seen.insert(name) {
                return Err(ServiceError::InvalidRequest(format!(
                    "duplicate query name '{name}'"
                )));
            }
        }
        Ok(())
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMeta {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub query_name: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSeries {
    #[serde(default)]
    pub query_name: String,
    #[serde(default)]
    pub meta_data: Option<SeriesMeta>,
    #[serde(default)]
    pub legend: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<Value>,
}
