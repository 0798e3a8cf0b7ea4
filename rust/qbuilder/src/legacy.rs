//! The V4/V5 boundary.
//!
//! Callers may still hold V4 builder queries (`filters.items[]`,
//! `aggregateOperator` + `aggregateAttribute`, `having` as a list). Those
//! keys are lifted out of the JSON object before the rest is read as a
//! [`BuilderQuery`], then [`normalize_to_v5`] folds them into the V5 fields.
//! Nothing past this module ever sees a legacy key.

use crate::{
    aggregation::{self, LegacyMetric},
    error::{Result, ServiceError},
    filter::{convert_filters_to_expression, FilterValue},
    model::{nullable_string, Aggregation, BuilderQuery, Having, Signal},
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// A legacy attribute reference (`aggregateAttribute`, filter keys).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeKey {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub key: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default, rename = "type")]
    pub field_type: Option<String>,
    #[serde(default)]
    pub is_column: Option<bool>,
    #[serde(default, rename = "isJSON")]
    pub is_json: Option<bool>,
    #[serde(default)]
    pub temporality: Option<String>,
}

impl AttributeKey {
    pub fn named(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    fn non_empty_key(&self) -> Option<&str> {
        let key = self.key.trim();
        (!key.is_empty()).then_some(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagFilterItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Option<AttributeKey>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub op: String,
    #[serde(default)]
    pub value: Option<FilterValue>,
}

fn default_join_op() -> String {
    "AND".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagFilter {
    #[serde(default)]
    pub items: Vec<TagFilterItem>,
    #[serde(default = "default_join_op")]
    pub op: String,
}

impl Default for TagFilter {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            op: default_join_op(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyHaving {
    pub column_name: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: Value,
}

/// V4-only fields lifted off a builder query object.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFields {
    #[serde(default)]
    pub aggregate_operator: Option<String>,
    #[serde(default)]
    pub aggregate_attribute: Option<AttributeKey>,
    #[serde(default)]
    pub filters: Option<TagFilter>,
    #[serde(default)]
    pub having: Vec<LegacyHaving>,
}

impl LegacyFields {
    fn is_empty(&self) -> bool {
        self.aggregate_operator.is_none()
            && self.aggregate_attribute.is_none()
            && self.filters.is_none()
            && self.having.is_empty()
    }
}

/// A builder query as read from a caller, in either shape.
#[derive(Debug, Clone, PartialEq)]
pub enum BuilderQueryInput {
    Current(BuilderQuery),
    Legacy {
        query: BuilderQuery,
        legacy: LegacyFields,
    },
}

const LEGACY_KEYS: [&str; 3] = ["aggregateOperator", "aggregateAttribute", "filters"];

impl BuilderQueryInput {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(ServiceError::invalid("builder query must be a JSON object"));
        };

        let mut lifted = Map::new();
        for key in LEGACY_KEYS {
            if let Some(value) = object.remove(key) {
                if !value.is_null() {
                    lifted.insert(key.to_string(), value);
                }
            }
        }
        if matches!(object.get("having"), Some(Value::Array(_))) {
            if let Some(having) = object.remove("having") {
                lifted.insert("having".to_string(), having);
            }
        }

        let query: BuilderQuery = serde_json::from_value(Value::Object(object))?;
        let legacy: LegacyFields = serde_json::from_value(Value::Object(lifted))?;

        if legacy.is_empty() {
            Ok(BuilderQueryInput::Current(query))
        } else {
            Ok(BuilderQueryInput::Legacy { query, legacy })
        }
    }
}

impl<'de> Deserialize<'de> for BuilderQueryInput {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        BuilderQueryInput::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Reads a list of builder queries in either shape and normalizes each.
pub fn deserialize_queries<'de, D>(deserializer: D) -> std::result::Result<Vec<BuilderQuery>, D::Error>
where
    D: Deserializer<'de>,
{
    let inputs = Option::<Vec<BuilderQueryInput>>::deserialize(deserializer)?.unwrap_or_default();
    inputs
        .into_iter()
        .map(normalize_to_v5)
        .collect::<Result<Vec<_>>>()
        .map_err(serde::de::Error::custom)
}

/// Folds any legacy fields into their V5 counterparts. Current-shape
/// metric queries also get their aggregation fields completed from the
/// query-level metric settings.
pub fn normalize_to_v5(input: BuilderQueryInput) -> Result<BuilderQuery> {
    let (mut query, legacy) = match input {
        BuilderQueryInput::Current(query) => (query, LegacyFields::default()),
        BuilderQueryInput::Legacy { query, legacy } => {
            debug!(query = %query.query_name, "normalizing legacy builder query");
            (query, legacy)
        }
    };

    let filter_is_blank = query.filter.as_ref().map_or(true, |filter| filter.is_blank());
    if filter_is_blank {
        if let Some(filters) = &legacy.filters {
            let converted = convert_filters_to_expression(filters);
            if !converted.is_blank() {
                query.filter = Some(converted);
            }
        }
    }

    if query.having.is_none() && !legacy.having.is_empty() {
        query.having = Some(Having {
            expression: aggregation::convert_having_to_expression(&legacy.having),
        });
    }

    let metric_name = legacy
        .aggregate_attribute
        .as_ref()
        .and_then(AttributeKey::non_empty_key);
    let operator = legacy
        .aggregate_operator
        .as_deref()
        .map(str::trim)
        .filter(|op| !op.is_empty());

    if query.aggregations.is_empty() {
        if let Some(operator) = operator {
            query = legacy_aggregations(query, operator, &legacy)?;
        }
    }

    if query.data_source == Signal::Metrics {
        query.aggregations = query
            .aggregations
            .iter()
            .map(|agg| match agg {
                Aggregation::Metric(metric) => Aggregation::Metric(
                    aggregation::fill_metric_aggregation(metric, &query, metric_name),
                ),
                other => other.clone(),
            })
            .collect();
    }

    Ok(query)
}

fn legacy_aggregations(
    query: BuilderQuery,
    operator: &str,
    legacy: &LegacyFields,
) -> Result<BuilderQuery> {
    let attribute = legacy.aggregate_attribute.as_ref();

    if query.data_source == Signal::Metrics {
        let aggregation = LegacyMetric {
            operator: Some(operator),
            metric_name: attribute.and_then(AttributeKey::non_empty_key),
            time_aggregation: query.time_aggregation.as_deref(),
            space_aggregation: query.space_aggregation.as_deref(),
            reduce_to: query.reduce_to.as_deref(),
            temporality: query
                .temporality
                .as_deref()
                .or(attribute.and_then(|attr| attr.temporality.as_deref())),
        }
        .into_aggregation();
        return Ok(BuilderQuery {
            aggregations: vec![aggregation],
            ..query
        });
    }

    let mapped =
        aggregation::map_aggregation(operator, attribute.and_then(AttributeKey::non_empty_key))?;
    Ok(mapped.apply(query))
}
