//! Built-in view profiles.
//!
//! A profile carries the fixed parts of a view (base predicates, default
//! grouping, field rewrites) as plain values handed to the composers.

use crate::{
    aggregation::map_aggregation,
    error::{Result, ServiceError},
    filter::{
        compose, FieldRewrite, FilterExpr, FilterValue, Operator, Predicate, Scalar, UserFilter,
    },
    group_by::compose_group_by,
    legacy::{AttributeKey, TagFilter, TagFilterItem},
    model::{BuilderQuery, CompositeQuery, Filter, Formula, GroupByKey, Signal},
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_STEP_INTERVAL: i64 = 60;

/// One builder query of a view composite.
#[derive(Debug, Clone, Copy)]
struct ViewMetric {
    name: &'static str,
    operator: &'static str,
    attribute: Option<&'static str>,
    legend: Option<&'static str>,
    /// Restricts the query to spans with `has_error = true`.
    errors_only: bool,
}

impl ViewMetric {
    const fn new(
        name: &'static str,
        operator: &'static str,
        attribute: Option<&'static str>,
    ) -> Self {
        Self {
            name,
            operator,
            attribute,
            legend: None,
            errors_only: false,
        }
    }

    const fn legend(self, legend: &'static str) -> Self {
        Self {
            legend: Some(legend),
            ..self
        }
    }

    const fn errors_only(self) -> Self {
        Self {
            errors_only: true,
            ..self
        }
    }
}

const DOMAIN_LIST_METRICS: &[ViewMetric] = &[
    ViewMetric::new("endpoints", "count_distinct", Some("http.url")),
    ViewMetric::new("lastseen", "max", Some("timestamp")),
    ViewMetric::new("rps", "rate", None),
    ViewMetric::new("error", "count", None).errors_only(),
    ViewMetric::new("total_span", "count", None),
    ViewMetric::new("p99", "p99", Some("duration_nano")),
];

const ERROR_RATE_FORMULA: (&str, &str) = ("error_rate", "(error/total_span)*100");

const ENDPOINT_LIST_METRICS: &[ViewMetric] = &[
    ViewMetric::new("A", "count", Some("span_id")),
    ViewMetric::new("B", "p99", Some("duration_nano")),
    ViewMetric::new("C", "max", Some("timestamp")),
];

const ENDPOINT_DETAIL_METRICS: &[ViewMetric] = &[
    ViewMetric::new("A", "rate", None).legend("Rate"),
    ViewMetric::new("B", "p99", Some("duration_nano")).legend("P99"),
    ViewMetric::new("C", "rate", None).legend("Error").errors_only(),
    ViewMetric::new("D", "max", Some("timestamp")).legend("Last seen"),
];

fn error_predicate() -> FilterExpr {
    Predicate::new("has_error", Operator::Eq, FilterValue::Scalar(Scalar::Bool(true))).into()
}

/// Appends one `=` item per grouped-by column of a selected table row to the
/// current filter items.
pub fn drill_down_filters(
    grouped_by_meta: &BTreeMap<String, Scalar>,
    current: &TagFilter,
) -> TagFilter {
    let mut items = current.items.clone();
    items.extend(grouped_by_meta.iter().map(|(key, value)| TagFilterItem {
        id: Some(key.clone()),
        key: Some(AttributeKey::named(key.as_str())),
        op: "=".to_string(),
        value: Some(FilterValue::Scalar(value.clone())),
    }));
    TagFilter {
        items,
        ..TagFilter::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewProfile {
    pub name: &'static str,
    pub signal: Signal,
    /// Dual-named fields matched against the selected domain.
    pub domain_fields: Vec<String>,
    pub kind: Option<Predicate>,
    pub existence: Option<Predicate>,
    pub default_group_by: Vec<GroupByKey>,
    pub rewrites: Vec<FieldRewrite>,
}

fn domain_fields() -> Vec<String> {
    vec!["net.peer.name".to_string(), "server.address".to_string()]
}

fn client_spans() -> Option<Predicate> {
    Some(Predicate::eq("kind_string", "Client"))
}

impl ViewProfile {
    pub fn domain_list() -> Self {
        Self {
            name: "domains",
            signal: Signal::Traces,
            domain_fields: Vec::new(),
            kind: client_spans(),
            existence: Some(Predicate::exists("net.peer.name")),
            default_group_by: vec![GroupByKey::new("net.peer.name", "string", "tag")],
            rewrites: Vec::new(),
        }
    }

    pub fn endpoints() -> Self {
        Self {
            name: "endpoints",
            signal: Signal::Traces,
            domain_fields: domain_fields(),
            kind: client_spans(),
            existence: None,
            default_group_by: vec![GroupByKey::new("http.url", "string", "tag")],
            rewrites: vec![FieldRewrite::http_url()],
        }
    }

    pub fn endpoint_status_codes() -> Self {
        Self {
            name: "status-codes",
            existence: Some(Predicate::exists("response_status_code")),
            default_group_by: vec![GroupByKey::new("response_status_code", "string", "tag")],
            ..Self::endpoints()
        }
    }

    pub fn log_context() -> Self {
        Self {
            name: "logs-context",
            signal: Signal::Logs,
            domain_fields: Vec::new(),
            kind: None,
            existence: None,
            default_group_by: Vec::new(),
            rewrites: Vec::new(),
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "domains" => Some(Self::domain_list()),
            "endpoints" => Some(Self::endpoints()),
            "status-codes" => Some(Self::endpoint_status_codes()),
            "logs-context" => Some(Self::log_context()),
            _ => None,
        }
    }

    /// Domain first, kind second, existence last. A blank domain is skipped.
    pub fn base_predicates(&self, domain: Option<&str>) -> Vec<FilterExpr> {
        let domain = domain
            .map(str::trim)
            .filter(|domain| !domain.is_empty() && !self.domain_fields.is_empty())
            .map(|domain| FilterExpr::any_field_eq(&self.domain_fields, domain));

        domain
            .into_iter()
            .chain(self.kind.clone().map(FilterExpr::from))
            .chain(self.existence.clone().map(FilterExpr::from))
            .collect()
    }

    pub fn compose_filter(&self, domain: Option<&str>, user: &UserFilter) -> String {
        compose(&self.base_predicates(domain), user, &self.rewrites)
    }

    /// Base predicates plus the selected row, if any.
    fn view_predicates(&self, request: &ViewQuery) -> Vec<FilterExpr> {
        let mut predicates = self.base_predicates(request.domain.as_deref());
        if !request.grouped_by_meta.is_empty() {
            let row = drill_down_filters(&request.grouped_by_meta, &TagFilter::default());
            predicates.extend(UserFilter::Items(row).to_expr());
        }
        predicates
    }

    pub fn endpoint_query(&self, request: &ViewQuery) -> Result<BuilderQuery> {
        let user = request.user_filter();
        let mut query = BuilderQuery::new(request.query_name.as_str(), self.signal);
        query.step_interval = Some(DEFAULT_STEP_INTERVAL);
        query.filter = Some(Filter::new(compose(
            &self.view_predicates(request),
            &user,
            &self.rewrites,
        )));
        query.group_by = compose_group_by(&self.default_group_by, &request.group_by);
        query.legend = request.legend.clone();

        let query = map_aggregation(&request.operator, request.attribute.as_deref())?.apply(query);
        debug!(
            view = self.name,
            query = %query.query_name,
            "composed view query"
        );
        Ok(query)
    }

    fn metric_query(
        &self,
        metric: &ViewMetric,
        predicates: &[FilterExpr],
        user: &UserFilter,
        group_by: &[GroupByKey],
    ) -> Result<BuilderQuery> {
        let mut base = predicates.to_vec();
        if metric.errors_only {
            base.push(error_predicate());
        }

        let mut query = BuilderQuery::new(metric.name, self.signal);
        query.step_interval = Some(DEFAULT_STEP_INTERVAL);
        query.filter = Some(Filter::new(compose(&base, user, &self.rewrites)));
        query.group_by = compose_group_by(&self.default_group_by, group_by);
        query.legend = metric.legend.map(str::to_string);
        Ok(map_aggregation(metric.operator, metric.attribute)?.apply(query))
    }

    fn metrics_composite(
        &self,
        metrics: &[ViewMetric],
        predicates: &[FilterExpr],
        request: &ViewQuery,
        group_by: &[GroupByKey],
    ) -> Result<CompositeQuery> {
        let user = request.user_filter();
        let queries = metrics
            .iter()
            .map(|metric| self.metric_query(metric, predicates, &user, group_by))
            .collect::<Result<Vec<_>>>()?;
        Ok(CompositeQuery::builder(queries, Vec::new()))
    }

    /// Six per-domain queries plus the error-rate formula.
    pub fn domain_list_composite(&self, request: &ViewQuery) -> Result<CompositeQuery> {
        let predicates = self.view_predicates(request);
        let mut composite =
            self.metrics_composite(DOMAIN_LIST_METRICS, &predicates, request, &request.group_by)?;
        let (name, expression) = ERROR_RATE_FORMULA;
        composite.builder.query_formulas = vec![Formula {
            query_name: name.to_string(),
            expression: expression.to_string(),
            ..Formula::default()
        }];
        Ok(composite)
    }

    /// Request count, p99 latency and last seen per endpoint of one domain.
    pub fn endpoint_list_composite(&self, request: &ViewQuery) -> Result<CompositeQuery> {
        let predicates = self.view_predicates(request);
        self.metrics_composite(ENDPOINT_LIST_METRICS, &predicates, request, &request.group_by)
    }

    /// Rate, p99, error rate and last seen of a single endpoint. The
    /// endpoint predicate comes first and nothing is grouped.
    pub fn endpoint_details_composite(
        &self,
        request: &ViewQuery,
        endpoint: &str,
    ) -> Result<CompositeQuery> {
        let mut predicates = vec![FilterExpr::from(Predicate::eq("http.url", endpoint))];
        predicates.extend(self.view_predicates(request));
        let mut detail = self.clone();
        detail.default_group_by = Vec::new();
        detail.metrics_composite(ENDPOINT_DETAIL_METRICS, &predicates, request, &[])
    }

    /// The multi-query composite a view renders as one table.
    pub fn composite(&self, request: &ViewQuery) -> Result<CompositeQuery> {
        let endpoint = request
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty());

        let composite = match (self.name, endpoint) {
            ("domains", _) => self.domain_list_composite(request)?,
            ("endpoints", Some(endpoint)) => self.endpoint_details_composite(request, endpoint)?,
            ("endpoints", None) => self.endpoint_list_composite(request)?,
            (name, _) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "view '{name}' has no composite query"
                )))
            }
        };
        debug!(
            view = self.name,
            queries = composite.builder.query_data.len(),
            "composed view composite"
        );
        Ok(composite)
    }
}

fn default_query_name() -> String {
    "A".to_string()
}

fn default_operator() -> String {
    "count".to_string()
}

/// Caller input for one view query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewQuery {
    #[serde(default = "default_query_name")]
    pub query_name: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub filters: Option<TagFilter>,
    #[serde(default)]
    pub group_by: Vec<GroupByKey>,
    #[serde(default)]
    pub legend: Option<String>,
    /// Selects a single endpoint for the detail composite.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Grouped-by values of a selected table row.
    #[serde(default)]
    pub grouped_by_meta: BTreeMap<String, Scalar>,
}

impl ViewQuery {
    fn user_filter(&self) -> UserFilter {
        UserFilter::from_parts(self.expression.clone(), self.filters.clone())
    }
}
