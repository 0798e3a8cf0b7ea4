//! Assembly of the V5 `query_range` request body.
//!
//! The composite query is expected to be normalized already (legacy input is
//! lifted by the deserializers), so this module only reshapes: one typed
//! envelope per emitted query, a millisecond window, format options and
//! dashboard variables, plus the legend of every emitted query.

use crate::{
    aggregation::expression_aggregations,
    error::Result,
    model::{
        Aggregation, BuilderQuery, CompositeQuery, ExpressionAggregation, FieldKey, Filter,
        Formula, FunctionArg, Having, MetricAggregation, OrderBy, QueryFunction, QueryType,
        RawQuery, Signal,
    },
    time::{instant_from_seconds, parse_time_value, TimeRange},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use tracing::debug;

pub const SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum PanelType {
    #[default]
    #[serde(rename = "graph")]
    TimeSeries,
    #[serde(rename = "bar")]
    Bar,
    #[serde(rename = "table")]
    Table,
    #[serde(rename = "pie")]
    Pie,
    #[serde(rename = "value")]
    Value,
    #[serde(rename = "trace")]
    Trace,
    #[serde(rename = "list")]
    List,
    #[serde(rename = "histogram")]
    Histogram,
    #[serde(other)]
    Other,
}

impl PanelType {
    pub fn request_type(&self) -> RequestType {
        match self {
            PanelType::TimeSeries | PanelType::Bar => RequestType::TimeSeries,
            PanelType::Table | PanelType::Pie | PanelType::Value => RequestType::Scalar,
            PanelType::Trace => RequestType::Trace,
            PanelType::List => RequestType::Raw,
            PanelType::Histogram => RequestType::Distribution,
            PanelType::Other => RequestType::Unknown,
        }
    }

    fn keeps_reduce_to(&self) -> bool {
        matches!(self, PanelType::Table | PanelType::Pie | PanelType::Value)
    }

    fn limits_by_page_size(&self) -> bool {
        matches!(self, PanelType::Table | PanelType::List)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    TimeSeries,
    Scalar,
    Trace,
    Raw,
    Distribution,
    Unknown,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::TimeSeries => "time_series",
            RequestType::Scalar => "scalar",
            RequestType::Trace => "trace",
            RequestType::Raw => "raw",
            RequestType::Distribution => "distribution",
            RequestType::Unknown => "",
        }
    }

    fn pages_rows(&self) -> bool {
        matches!(self, RequestType::Raw | RequestType::Trace)
    }
}

impl Serialize for RequestType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

const CANONICAL_FUNCTIONS: &[&str] = &[
    "cutOffMin",
    "cutOffMax",
    "clampMin",
    "clampMax",
    "absolute",
    "runningDiff",
    "log2",
    "log10",
    "cumulativeSum",
    "ewma3",
    "ewma5",
    "ewma7",
    "median3",
    "median5",
    "median7",
    "timeShift",
    "anomaly",
    "fillZero",
];

/// Canonical spelling of a post-processing function; unknown names pass
/// through.
pub fn normalize_function_name(name: &str) -> String {
    CANONICAL_FUNCTIONS
        .iter()
        .find(|canonical| canonical.eq_ignore_ascii_case(name.trim()))
        .map(|canonical| canonical.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Fields the backend resolves without a context; sending one breaks lookup.
const DEPRECATED_FIELDS: &[&str] = &[
    "traceID",
    "spanID",
    "parentSpanID",
    "spanKind",
    "durationNano",
    "statusCode",
    "statusMessage",
    "statusCodeString",
    "responseStatusCode",
    "externalHttpUrl",
    "httpUrl",
    "externalHttpMethod",
    "httpMethod",
    "httpHost",
    "dbName",
    "dbOperation",
    "hasError",
    "isRemote",
    "serviceName",
    "httpRoute",
    "msgSystem",
    "msgOperation",
    "dbSystem",
    "rpcSystem",
    "rpcService",
    "rpcMethod",
    "peerService",
];

fn carries_context(name: &str) -> bool {
    name != "name" && !DEPRECATED_FIELDS.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupByField {
    pub name: String,
    pub field_data_type: String,
    pub field_context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderKey {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSpec {
    pub key: OrderKey,
    pub direction: String,
}

impl From<&OrderBy> for OrderSpec {
    fn from(order: &OrderBy) -> Self {
        Self {
            key: OrderKey {
                name: order.column_name.clone(),
            },
            direction: order.order.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SpecAggregation {
    Expression(ExpressionAggregation),
    Metric(MetricAggregation),
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderQuerySpec {
    pub name: String,
    pub signal: Option<Signal>,
    pub source: Option<String>,
    #[serialize_always]
    pub step_interval: Option<i64>,
    pub disabled: bool,
    pub expression: Option<String>,
    pub filter: Option<Filter>,
    pub group_by: Option<Vec<GroupByField>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub order: Option<Vec<OrderSpec>>,
    pub legend: Option<String>,
    pub having: Option<Having>,
    pub functions: Option<Vec<QueryFunction>>,
    pub select_fields: Option<Vec<FieldKey>>,
    pub aggregations: Option<Vec<SpecAggregation>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormulaSpec {
    pub name: String,
    pub expression: String,
    pub disabled: bool,
    pub limit: Option<i64>,
    pub legend: Option<String>,
    pub order: Option<Vec<OrderSpec>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromqlSpec {
    pub name: String,
    pub query: String,
    pub disabled: bool,
    pub step: Option<i64>,
    pub legend: Option<String>,
    pub stats: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickhouseSpec {
    pub name: String,
    pub query: String,
    pub disabled: bool,
    pub legend: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "spec", rename_all = "snake_case")]
pub enum QueryEnvelope {
    BuilderQuery(BuilderQuerySpec),
    BuilderFormula(FormulaSpec),
    BuilderTraceOperator(BuilderQuerySpec),
    Promql(PromqlSpec),
    ClickhouseSql(ClickhouseSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryList {
    pub queries: Vec<QueryEnvelope>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    #[serde(rename = "formatTableResultForUI")]
    pub format_table_result_for_ui: bool,
    pub fill_gaps: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableItem {
    pub value: Value,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRangePayload {
    pub schema_version: String,
    pub start: i64,
    pub end: i64,
    pub request_type: RequestType,
    pub composite_query: QueryList,
    pub format_options: FormatOptions,
    pub variables: BTreeMap<String, VariableItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedPayload {
    pub query_payload: QueryRangePayload,
    pub legend_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Everything the assembler needs from a panel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadRequest {
    pub query: CompositeQuery,
    #[serde(default)]
    pub graph_type: PanelType,
    #[serde(default)]
    pub original_graph_type: Option<PanelType>,
    /// Relative preset such as `15m` or `last_7d`.
    #[serde(default)]
    pub global_selected_interval: Option<String>,
    /// Explicit window bounds in seconds; each overrides the preset.
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub dynamic_variables: Vec<DynamicVariable>,
    #[serde(default)]
    pub format_for_web: bool,
    #[serde(default)]
    pub fill_gaps: bool,
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
}

fn orders(order_by: &[OrderBy]) -> Option<Vec<OrderSpec>> {
    (!order_by.is_empty()).then(|| order_by.iter().map(OrderSpec::from).collect())
}

fn functions(query: &BuilderQuery) -> Option<Vec<QueryFunction>> {
    if query.functions.is_empty() {
        return None;
    }
    let out = query
        .functions
        .iter()
        .map(|function| {
            let args = if function.named_args.is_empty() {
                function
                    .args
                    .iter()
                    .map(|arg| FunctionArg {
                        name: None,
                        value: arg.value.clone(),
                    })
                    .collect()
            } else {
                function
                    .named_args
                    .iter()
                    .map(|(name, value)| FunctionArg {
                        name: Some(name.clone()),
                        value: value.clone(),
                    })
                    .collect()
            };
            QueryFunction {
                name: normalize_function_name(&function.name),
                args,
                named_args: BTreeMap::new(),
            }
        })
        .collect();
    Some(out)
}

fn select_fields(query: &BuilderQuery) -> Option<Vec<FieldKey>> {
    let fields: Vec<FieldKey> = query
        .select_columns
        .iter()
        .filter(|field| !field.name.trim().is_empty())
        .map(|field| FieldKey {
            name: field.name.clone(),
            field_data_type: field.field_data_type.clone(),
            field_context: field
                .field_context
                .clone()
                .filter(|_| carries_context(&field.name)),
        })
        .collect();
    (!fields.is_empty()).then_some(fields)
}

fn metric_aggregation(query: &BuilderQuery, panel: PanelType) -> MetricAggregation {
    let declared = query.aggregations.iter().find_map(|agg| match agg {
        Aggregation::Metric(metric) => Some(metric),
        Aggregation::Expression(_) => None,
    });
    fn pick(own: Option<&Option<String>>, fallback: &Option<String>) -> Option<String> {
        own.and_then(|value| non_blank(value.as_deref()))
            .or_else(|| non_blank(fallback.as_deref()))
    }

    MetricAggregation {
        metric_name: declared
            .map(|metric| metric.metric_name.clone())
            .unwrap_or_default(),
        temporality: pick(declared.map(|m| &m.temporality), &query.temporality),
        time_aggregation: pick(declared.map(|m| &m.time_aggregation), &query.time_aggregation),
        space_aggregation: pick(
            declared.map(|m| &m.space_aggregation),
            &query.space_aggregation,
        ),
        reduce_to: pick(declared.map(|m| &m.reduce_to), &query.reduce_to)
            .filter(|_| panel.keeps_reduce_to()),
    }
}

fn aggregations(query: &BuilderQuery, panel: PanelType) -> Vec<SpecAggregation> {
    match query.data_source {
        Signal::Metrics => vec![SpecAggregation::Metric(metric_aggregation(query, panel))],
        Signal::Logs | Signal::Traces => expression_aggregations(query)
            .into_iter()
            .map(SpecAggregation::Expression)
            .collect(),
    }
}

/// The `spec` of a `builder_query` envelope.
pub fn builder_query_spec(query: &BuilderQuery, panel: PanelType) -> BuilderQuerySpec {
    let request_type = panel.request_type();
    let group_by: Vec<GroupByField> = query
        .group_by
        .iter()
        .map(|key| GroupByField {
            name: key.key.clone(),
            field_data_type: key.data_type.clone(),
            field_context: key.field_type.clone(),
        })
        .collect();

    let limit = query.limit.filter(|limit| *limit != 0);
    let limit = if panel.limits_by_page_size() {
        limit.or(query.page_size.filter(|size| *size != 0))
    } else {
        limit
    };

    BuilderQuerySpec {
        name: query.query_name.clone(),
        signal: Some(query.data_source),
        source: (query.data_source == Signal::Metrics)
            .then(|| query.source.clone().unwrap_or_default()),
        step_interval: query.step_interval.filter(|step| *step != 0),
        disabled: query.disabled,
        expression: None,
        filter: Some(Filter::new(query.filter_expression())),
        group_by: (!group_by.is_empty()).then_some(group_by),
        limit,
        offset: if request_type.pages_rows() {
            query.offset
        } else {
            None
        },
        order: orders(&query.order_by),
        legend: non_blank(query.legend.as_deref()),
        having: query
            .having
            .clone()
            .filter(|having| !having.expression.trim().is_empty()),
        functions: functions(query),
        select_fields: select_fields(query),
        aggregations: (request_type != RequestType::Raw).then(|| aggregations(query, panel)),
    }
}

fn trace_operator_spec(operator: &BuilderQuery, panel: PanelType) -> BuilderQuerySpec {
    let mut spec = builder_query_spec(operator, panel);
    spec.source = None;
    spec.expression = operator.expression.clone();
    spec
}

fn formula_spec(formula: &Formula) -> FormulaSpec {
    FormulaSpec {
        name: formula.query_name.clone(),
        expression: formula.expression.clone(),
        disabled: formula.disabled,
        limit: formula.limit,
        legend: non_blank(formula.legend.as_deref()),
        order: orders(&formula.order_by),
    }
}

fn raw_entries(queries: &[RawQuery]) -> impl Iterator<Item = &RawQuery> {
    queries.iter().filter(|raw| !raw.query.trim().is_empty())
}

fn builder_envelopes(
    query: &CompositeQuery,
    panel: PanelType,
    legend_map: &mut BTreeMap<String, String>,
) -> Vec<QueryEnvelope> {
    let builder = &query.builder;
    let mut envelopes = Vec::new();

    for data in &builder.query_data {
        legend_map.insert(
            data.query_name.clone(),
            data.legend.clone().unwrap_or_default(),
        );
        envelopes.push(QueryEnvelope::BuilderQuery(builder_query_spec(data, panel)));
    }

    for formula in &builder.query_formulas {
        legend_map.insert(
            formula.query_name.clone(),
            formula.legend.clone().unwrap_or_default(),
        );
        envelopes.push(QueryEnvelope::BuilderFormula(formula_spec(formula)));
    }

    for operator in builder
        .query_trace_operator
        .iter()
        .filter(|op| op.expression.as_deref().is_some_and(|e| !e.trim().is_empty()))
    {
        legend_map.insert(
            operator.query_name.clone(),
            operator.legend.clone().unwrap_or_default(),
        );
        envelopes.push(QueryEnvelope::BuilderTraceOperator(trace_operator_spec(
            operator, panel,
        )));
    }

    envelopes
}

fn raw_envelopes(
    query: &CompositeQuery,
    legend_map: &mut BTreeMap<String, String>,
) -> Vec<QueryEnvelope> {
    let entries: Vec<&RawQuery> = match query.query_type {
        QueryType::Promql => raw_entries(&query.promql).collect(),
        _ => raw_entries(&query.clickhouse_sql).collect(),
    };

    entries
        .into_iter()
        .map(|raw| {
            legend_map.insert(raw.name.clone(), raw.legend.clone().unwrap_or_default());
            match query.query_type {
                QueryType::Promql => QueryEnvelope::Promql(PromqlSpec {
                    name: raw.name.clone(),
                    query: raw.query.clone(),
                    disabled: raw.disabled,
                    step: raw.step_interval,
                    legend: non_blank(raw.legend.as_deref()),
                    stats: false,
                }),
                _ => QueryEnvelope::ClickhouseSql(ClickhouseSpec {
                    name: raw.name.clone(),
                    query: raw.query.clone(),
                    disabled: raw.disabled,
                    legend: non_blank(raw.legend.as_deref()),
                }),
            }
        })
        .collect()
}

/// Query window in milliseconds. Explicit seconds win per bound; missing
/// bounds come from the selected preset, else `default_interval`.
pub fn resolve_window(
    request: &PayloadRequest,
    default_interval: &str,
    now: DateTime<Utc>,
) -> Result<(i64, i64)> {
    if let (Some(start), Some(end)) = (request.start, request.end) {
        let range = TimeRange::from_seconds(start, end)?;
        return Ok((range.start_millis(), range.end_millis()));
    }

    let preset = non_blank(request.global_selected_interval.as_deref())
        .unwrap_or_else(|| default_interval.to_string());
    let preset = parse_time_value(&preset)?.resolve(now)?;
    let start = match request.start {
        Some(seconds) => instant_from_seconds(seconds, "start")?,
        None => preset.start,
    };
    let end = match request.end {
        Some(seconds) => instant_from_seconds(seconds, "end")?,
        None => preset.end,
    };
    let range = TimeRange::new(start, end)?;
    Ok((range.start_millis(), range.end_millis()))
}

fn variables(request: &PayloadRequest) -> BTreeMap<String, VariableItem> {
    request
        .variables
        .iter()
        .map(|(name, value)| {
            let kind = request
                .dynamic_variables
                .iter()
                .find(|dynamic| &dynamic.name == name)
                .map(|dynamic| dynamic.kind.to_lowercase());
            (
                name.clone(),
                VariableItem {
                    value: value.clone(),
                    kind,
                },
            )
        })
        .collect()
}

pub fn prepare_query_range_payload(
    request: &PayloadRequest,
    default_interval: &str,
    now: DateTime<Utc>,
) -> Result<PreparedPayload> {
    request.query.validate()?;

    let panel = request.graph_type;
    let mut legend_map = BTreeMap::new();
    let queries = match request.query.query_type {
        QueryType::Builder => builder_envelopes(&request.query, panel, &mut legend_map),
        QueryType::Promql | QueryType::ClickhouseSql => {
            raw_envelopes(&request.query, &mut legend_map)
        }
    };
    let (start, end) = resolve_window(request, default_interval, now)?;

    let table = request.original_graph_type.unwrap_or(panel) == PanelType::Table;
    debug!(
        queries = queries.len(),
        request_type = panel.request_type().as_str(),
        "assembled query range payload"
    );

    Ok(PreparedPayload {
        query_payload: QueryRangePayload {
            schema_version: SCHEMA_VERSION.to_string(),
            start,
            end,
            request_type: panel.request_type(),
            composite_query: QueryList { queries },
            format_options: FormatOptions {
                format_table_result_for_ui: request.format_for_web || table,
                fill_gaps: request.fill_gaps,
            },
            variables: variables(request),
        },
        legend_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ServiceError,
        model::{Direction, GroupByKey},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn request(query: CompositeQuery, graph_type: PanelType) -> PayloadRequest {
        PayloadRequest {
            query,
            graph_type,
            start: Some(1_699_999_100),
            end: Some(1_700_000_000),
            ..PayloadRequest::default()
        }
    }

    fn prepare(request: &PayloadRequest) -> Value {
        let prepared = prepare_query_range_payload(request, "15m", now()).unwrap();
        serde_json::to_value(prepared).unwrap()
    }

    fn traces_query() -> BuilderQuery {
        let mut query = BuilderQuery::new("A", Signal::Traces);
        query.filter = Some(Filter::new("service.name = 'frontend'"));
        query.aggregations = vec![Aggregation::expression("count() as 'calls' p99(duration_nano)")];
        query.group_by = vec![GroupByKey::new("http.url", "string", "tag")];
        query.order_by = vec![OrderBy::new("timestamp", Direction::Desc)];
        query.legend = Some("{{http.url}}".into());
        query
    }

    #[test]
    fn panel_types_map_to_request_types() {
        let cases = [
            ("graph", "time_series"),
            ("bar", "time_series"),
            ("table", "scalar"),
            ("pie", "scalar"),
            ("value", "scalar"),
            ("trace", "trace"),
            ("list", "raw"),
            ("histogram", "distribution"),
            ("EMPTY_WIDGET", ""),
        ];
        for (panel, expected) in cases {
            let panel: PanelType = serde_json::from_value(json!(panel)).unwrap();
            assert_eq!(panel.request_type().as_str(), expected);
        }
    }

    #[test]
    fn builder_query_envelope_for_time_series() {
        let payload = prepare(&request(
            CompositeQuery::builder(vec![traces_query()], vec![]),
            PanelType::TimeSeries,
        ));
        assert_eq!(
            payload["queryPayload"]["compositeQuery"]["queries"][0],
            json!({
                "type": "builder_query",
                "spec": {
                    "name": "A",
                    "signal": "traces",
                    "stepInterval": null,
                    "disabled": false,
                    "filter": { "expression": "service.name = 'frontend'" },
                    "groupBy": [{
                        "name": "http.url",
                        "fieldDataType": "string",
                        "fieldContext": "tag"
                    }],
                    "order": [{ "key": { "name": "timestamp" }, "direction": "desc" }],
                    "legend": "{{http.url}}",
                    "aggregations": [
                        { "expression": "count()", "alias": "calls" },
                        { "expression": "p99(duration_nano)" }
                    ]
                }
            })
        );
        assert_eq!(payload["queryPayload"]["start"], json!(1_699_999_100_000_i64));
        assert_eq!(payload["queryPayload"]["end"], json!(1_700_000_000_000_i64));
        assert_eq!(payload["queryPayload"]["schemaVersion"], json!("v1"));
        assert_eq!(payload["legendMap"], json!({ "A": "{{http.url}}" }));
    }

    #[test]
    fn list_panels_page_and_drop_aggregations() {
        let mut query = BuilderQuery::new("A", Signal::Logs);
        query.page_size = Some(50);
        query.offset = Some(100);
        query.aggregations = vec![Aggregation::expression("count()")];
        let payload = prepare(&request(
            CompositeQuery::builder(vec![query], vec![]),
            PanelType::List,
        ));
        let spec = &payload["queryPayload"]["compositeQuery"]["queries"][0]["spec"];
        assert_eq!(spec["limit"], json!(50));
        assert_eq!(spec["offset"], json!(100));
        assert!(spec.get("aggregations").is_none());
        assert_eq!(payload["queryPayload"]["requestType"], json!("raw"));
    }

    #[test]
    fn graph_panels_ignore_page_size_and_offset() {
        let mut query = BuilderQuery::new("A", Signal::Logs);
        query.page_size = Some(50);
        query.offset = Some(100);
        query.step_interval = Some(0);
        let payload = prepare(&request(
            CompositeQuery::builder(vec![query], vec![]),
            PanelType::TimeSeries,
        ));
        let spec = &payload["queryPayload"]["compositeQuery"]["queries"][0]["spec"];
        assert!(spec.get("limit").is_none());
        assert!(spec.get("offset").is_none());
        assert_eq!(spec["stepInterval"], Value::Null);
        assert_eq!(spec["aggregations"], json!([{ "expression": "count()" }]));
    }

    #[test]
    fn metric_reduce_to_only_for_scalar_panels() {
        let mut query = BuilderQuery::new("A", Signal::Metrics);
        query.aggregations = vec![Aggregation::Metric(MetricAggregation {
            metric_name: "signoz_calls_total".into(),
            time_aggregation: Some("rate".into()),
            space_aggregation: Some("sum".into()),
            reduce_to: Some("avg".into()),
            ..MetricAggregation::default()
        })];
        let composite = CompositeQuery::builder(vec![query], vec![]);

        let graph = prepare(&request(composite.clone(), PanelType::TimeSeries));
        let spec = &graph["queryPayload"]["compositeQuery"]["queries"][0]["spec"];
        assert_eq!(spec["source"], json!(""));
        assert_eq!(
            spec["aggregations"],
            json!([{
                "metricName": "signoz_calls_total",
                "timeAggregation": "rate",
                "spaceAggregation": "sum"
            }])
        );

        let value = prepare(&request(composite, PanelType::Value));
        let spec = &value["queryPayload"]["compositeQuery"]["queries"][0]["spec"];
        assert_eq!(spec["aggregations"][0]["reduceTo"], json!("avg"));
    }

    #[test]
    fn formulas_and_trace_operators_get_their_own_envelopes() {
        let mut composite = CompositeQuery::builder(
            vec![traces_query(), {
                let mut b = BuilderQuery::new("B", Signal::Traces);
                b.legend = Some("errors".into());
                b
            }],
            vec![Formula {
                query_name: "F1".into(),
                expression: "B / A".into(),
                legend: Some("error rate".into()),
                ..Formula::default()
            }],
        );
        let mut operator = BuilderQuery::new("T1", Signal::Traces);
        operator.expression = Some("A && B".into());
        let mut blank = BuilderQuery::new("T2", Signal::Traces);
        blank.expression = Some("  ".into());
        composite.builder.query_trace_operator = vec![operator, blank];

        let payload = prepare(&request(composite, PanelType::List));
        let queries = payload["queryPayload"]["compositeQuery"]["queries"]
            .as_array()
            .unwrap();
        let types: Vec<&str> = queries.iter().map(|q| q["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec!["builder_query", "builder_query", "builder_formula", "builder_trace_operator"]
        );
        assert_eq!(
            queries[2]["spec"],
            json!({
                "name": "F1",
                "expression": "B / A",
                "disabled": false,
                "legend": "error rate"
            })
        );
        assert_eq!(queries[3]["spec"]["expression"], json!("A && B"));
        assert_eq!(
            payload["legendMap"],
            json!({ "A": "{{http.url}}", "B": "errors", "F1": "error rate", "T1": "" })
        );
    }

    #[test]
    fn promql_entries_without_query_are_dropped() {
        let composite = CompositeQuery {
            query_type: QueryType::Promql,
            promql: vec![
                RawQuery {
                    name: "A".into(),
                    query: "sum(rate(http_requests_total[5m]))".into(),
                    legend: Some("rps".into()),
                    step_interval: Some(60),
                    ..RawQuery::default()
                },
                RawQuery {
                    name: "B".into(),
                    ..RawQuery::default()
                },
            ],
            ..CompositeQuery::default()
        };
        let payload = prepare(&request(composite, PanelType::TimeSeries));
        assert_eq!(
            payload["queryPayload"]["compositeQuery"]["queries"],
            json!([{
                "type": "promql",
                "spec": {
                    "name": "A",
                    "query": "sum(rate(http_requests_total[5m]))",
                    "disabled": false,
                    "step": 60,
                    "legend": "rps",
                    "stats": false
                }
            }])
        );
        assert_eq!(payload["legendMap"], json!({ "A": "rps" }));
    }

    #[test]
    fn clickhouse_entries_use_their_own_envelope() {
        let composite = CompositeQuery {
            query_type: QueryType::ClickhouseSql,
            clickhouse_sql: vec![RawQuery {
                name: "A".into(),
                query: "SELECT 1".into(),
                ..RawQuery::default()
            }],
            ..CompositeQuery::default()
        };
        let payload = prepare(&request(composite, PanelType::Table));
        let query = &payload["queryPayload"]["compositeQuery"]["queries"][0];
        assert_eq!(query["type"], json!("clickhouse_sql"));
        assert_eq!(
            payload["queryPayload"]["formatOptions"],
            json!({ "formatTableResultForUI": true, "fillGaps": false })
        );
    }

    #[test]
    fn functions_are_normalized_and_context_is_dropped_for_deprecated_fields() {
        let mut query = BuilderQuery::new("A", Signal::Traces);
        query.functions = vec![
            QueryFunction {
                name: "CUTOFFMIN".into(),
                args: vec![FunctionArg {
                    name: None,
                    value: json!(10),
                }],
                named_args: BTreeMap::new(),
            },
            QueryFunction {
                name: "anomaly".into(),
                args: vec![],
                named_args: BTreeMap::from([("z_score_threshold".to_string(), json!(3))]),
            },
        ];
        query.select_columns = vec![
            FieldKey {
                name: "serviceName".into(),
                field_data_type: Some("string".into()),
                field_context: Some("tag".into()),
            },
            FieldKey {
                name: "http.method".into(),
                field_data_type: Some("string".into()),
                field_context: Some("attribute".into()),
            },
            FieldKey::default(),
        ];
        let spec = serde_json::to_value(builder_query_spec(&query, PanelType::List)).unwrap();
        assert_eq!(
            spec["functions"],
            json!([
                { "name": "cutOffMin", "args": [{ "value": 10 }] },
                { "name": "anomaly", "args": [{ "name": "z_score_threshold", "value": 3 }] }
            ])
        );
        assert_eq!(
            spec["selectFields"],
            json!([
                { "name": "serviceName", "fieldDataType": "string" },
                { "name": "http.method", "fieldDataType": "string", "fieldContext": "attribute" }
            ])
        );
    }

    #[test]
    fn variables_carry_dynamic_types() {
        let mut req = request(CompositeQuery::default(), PanelType::TimeSeries);
        req.variables = BTreeMap::from([
            ("env".to_string(), json!("prod")),
            ("service".to_string(), json!(["a", "b"])),
        ]);
        req.dynamic_variables = vec![DynamicVariable {
            name: "service".into(),
            kind: "RESOURCE".into(),
        }];
        let payload = prepare(&req);
        assert_eq!(
            payload["queryPayload"]["variables"],
            json!({
                "env": { "value": "prod" },
                "service": { "value": ["a", "b"], "type": "resource" }
            })
        );
    }

    #[test]
    fn window_falls_back_to_presets() {
        let mut req = request(CompositeQuery::default(), PanelType::TimeSeries);
        req.start = None;
        req.end = None;
        let (start, end) = resolve_window(&req, "15m", now()).unwrap();
        assert_eq!(end, 1_700_000_000_000);
        assert_eq!(end - start, 15 * 60 * 1000);

        req.global_selected_interval = Some("1h".into());
        let (start, end) = resolve_window(&req, "15m", now()).unwrap();
        assert_eq!(end - start, 60 * 60 * 1000);

        req.global_selected_interval = Some("sometime".into());
        assert!(resolve_window(&req, "15m", now()).is_err());
    }

    #[test]
    fn single_bound_overrides_preset_bound() {
        let mut req = request(CompositeQuery::default(), PanelType::TimeSeries);
        req.start = Some(1_699_999_000);
        req.end = None;
        let (start, end) = resolve_window(&req, "15m", now()).unwrap();
        assert_eq!(start, 1_699_999_000_000);
        assert_eq!(end, 1_700_000_000_000);
    }

    #[test]
    fn single_bound_out_of_range_is_rejected() {
        let mut req = request(CompositeQuery::default(), PanelType::TimeSeries);
        req.start = Some(i64::MAX / 10);
        req.end = None;
        assert!(matches!(
            resolve_window(&req, "15m", now()),
            Err(ServiceError::InvalidRequest(_))
        ));

        req.start = None;
        req.end = Some(i64::MIN / 10);
        assert!(resolve_window(&req, "15m", now()).is_err());
    }

    #[test]
    fn single_bound_past_preset_end_is_rejected() {
        let mut req = request(CompositeQuery::default(), PanelType::TimeSeries);
        req.start = Some(1_700_000_600);
        req.end = None;
        let err = resolve_window(&req, "15m", now()).unwrap_err();
        assert!(err.to_string().contains("start must be before end"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let composite = CompositeQuery::builder(
            vec![BuilderQuery::new("A", Signal::Logs), BuilderQuery::new("A", Signal::Logs)],
            vec![],
        );
        let err = prepare_query_range_payload(&request(composite, PanelType::TimeSeries), "15m", now())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate query name"));
    }
}
