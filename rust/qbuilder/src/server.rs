use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    legacy::{normalize_to_v5, BuilderQueryInput},
    legend::{get_legend, query_labels_with_aggregation, QueryLabel},
    model::{BuilderQuery, CompositeQuery, Direction, OrderBy, ResultSeries},
    pagination::{decode_cursor, page_for_offset, paginate, PageTokens},
    payload::{prepare_query_range_payload, PayloadRequest, PreparedPayload},
    splitter::split_into_one_chart_per_query,
    state::AppState,
    views::{ViewProfile, ViewQuery},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

#[derive(Debug, Deserialize)]
pub struct LegendRequest {
    pub query: CompositeQuery,
    #[serde(default)]
    pub series: Vec<ResultSeries>,
}

#[derive(Debug, Serialize)]
pub struct LegendResponse {
    pub legends: Vec<String>,
    pub labels: Vec<QueryLabel>,
}

#[derive(Debug, Serialize)]
pub struct SplitResponse {
    pub queries: Vec<CompositeQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogContextRequest {
    pub query: BuilderQueryInput,
    #[serde(default)]
    pub anchor_log_id: Option<String>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
    /// Wins over `page` when present.
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogContextResponse {
    pub query: BuilderQuery,
    pub page: i64,
    pub page_size: i64,
    #[serde(flatten)]
    pub tokens: PageTokens,
}

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub query: BuilderQuery,
}

#[derive(Debug, Serialize)]
pub struct ViewCompositeResponse {
    pub query: CompositeQuery,
}

/// Series label the backend would show: its own legend, else the label
/// values, else the query name.
fn fallback_label(series: &ResultSeries) -> String {
    if let Some(legend) = series.legend.as_deref().filter(|l| !l.trim().is_empty()) {
        return legend.to_string();
    }
    if !series.labels.is_empty() {
        return series
            .labels
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join("-");
    }
    series.query_name.clone()
}

impl Server {
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config));
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/v5/compose", post(Self::compose))
            .route("/api/v5/legend", post(Self::legend))
            .route("/api/v5/split", post(Self::split))
            .route("/api/v5/logs/context", post(Self::log_context))
            .route("/api/v5/views/:view", post(Self::view))
            .route("/api/v5/views/:view/composite", post(Self::view_composite))
            .with_state(self.state.clone())
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "qbuilder listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn compose(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<PayloadRequest>,
    ) -> Result<Json<PreparedPayload>> {
        enforce_api_key(&headers, &state.config)?;
        let prepared =
            prepare_query_range_payload(&request, &state.config.default_time_range, Utc::now())?;
        Ok(Json(prepared))
    }

    async fn legend(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<LegendRequest>,
    ) -> Result<Json<LegendResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let legends = request
            .series
            .iter()
            .map(|series| get_legend(series, &request.query, &fallback_label(series)))
            .collect();
        let labels = query_labels_with_aggregation(&request.query.builder.query_data);
        Ok(Json(LegendResponse { legends, labels }))
    }

    async fn split(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(query): Json<CompositeQuery>,
    ) -> Result<Json<SplitResponse>> {
        enforce_api_key(&headers, &state.config)?;
        query.validate()?;
        let queries = split_into_one_chart_per_query(&query);
        Ok(Json(SplitResponse { queries }))
    }

    async fn log_context(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<LogContextRequest>,
    ) -> Result<Json<LogContextResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let staged = normalize_to_v5(request.query)?;
        let page_size = state.config.page_size(request.page_size);
        let page = match request.cursor.as_deref() {
            Some(cursor) => page_for_offset(decode_cursor(cursor)?, page_size)?,
            None => request.page.unwrap_or(1).max(1),
        };
        let order_by = request
            .order_by
            .unwrap_or_else(|| OrderBy::new("timestamp", Direction::Desc));

        let paged = paginate(
            &staged,
            request.anchor_log_id.as_deref(),
            &order_by,
            page,
            page_size,
        )?;
        let tokens = PageTokens::around(paged.offset, page_size)?;
        Ok(Json(LogContextResponse {
            query: paged.apply_to(&staged),
            page,
            page_size,
            tokens,
        }))
    }

    async fn view(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(view): Path<String>,
        Json(request): Json<ViewQuery>,
    ) -> Result<Json<ViewResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let query = view_profile(&view)?.endpoint_query(&request)?;
        Ok(Json(ViewResponse { query }))
    }

    async fn view_composite(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(view): Path<String>,
        Json(request): Json<ViewQuery>,
    ) -> Result<Json<ViewCompositeResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let query = view_profile(&view)?.composite(&request)?;
        Ok(Json(ViewCompositeResponse { query }))
    }
}

fn view_profile(view: &str) -> Result<ViewProfile> {
    ViewProfile::by_name(view)
        .ok_or_else(|| ServiceError::NotFound(format!("unknown view '{view}'")))
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
