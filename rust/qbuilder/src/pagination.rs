//! Offset paging for the log-context view plus opaque page tokens.
//!
//! Rows are ordered by timestamp and, past the first page, by `id` in the
//! same direction so ordering is total. The anchor row never becomes an `id`
//! filter: every page re-issues the same time-bounded query at a larger
//! offset, so rows arriving between fetches do not shift rendered pages.
//! Deep offsets are a known scalability limit of this scheme.

use crate::{
    error::{Result, ServiceError},
    model::{BuilderQuery, CompositeQuery, Filter, OrderBy},
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const TIE_BREAK_COLUMN: &str = "id";

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    offset: i64,
}

pub fn decode_cursor(cursor: &str) -> Result<i64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ServiceError::invalid("invalid cursor"))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|_| ServiceError::invalid("invalid cursor payload"))?;
    Ok(payload.offset.max(0))
}

pub fn encode_cursor(offset: i64) -> Result<String> {
    let payload = CursorPayload {
        offset: offset.max(0),
    };
    let bytes = serde_json::to_vec(&payload).map_err(|err| {
        ServiceError::Internal(anyhow::Error::new(err).context("failed to encode page cursor"))
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn offset_overflow() -> ServiceError {
    ServiceError::invalid("page offset is out of range")
}

/// The paging fields to merge into a staged query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedQuery {
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    pub offset: i64,
    pub page_size: i64,
    pub limit: Option<i64>,
}

impl PaginatedQuery {
    pub fn apply_to(&self, query: &BuilderQuery) -> BuilderQuery {
        BuilderQuery {
            filter: self.filter.clone(),
            order_by: self.order_by.clone(),
            offset: Some(self.offset),
            page_size: Some(self.page_size),
            limit: self.limit,
            ..query.clone()
        }
    }
}

pub fn paginate(
    staged: &BuilderQuery,
    anchor_log_id: Option<&str>,
    order_by_timestamp: &OrderBy,
    page: i64,
    page_size: i64,
) -> Result<PaginatedQuery> {
    let page = page.max(1);
    let page_size = page_size.max(1);
    let anchored = anchor_log_id.is_some_and(|id| !id.trim().is_empty());

    let mut order_by = vec![order_by_timestamp.clone()];
    if (page > 1 || anchored) && order_by_timestamp.column_name != TIE_BREAK_COLUMN {
        order_by.push(OrderBy::new(TIE_BREAK_COLUMN, order_by_timestamp.order));
    }

    let offset = (page - 1).checked_mul(page_size).ok_or_else(offset_overflow)?;

    Ok(PaginatedQuery {
        filter: staged.filter.clone(),
        order_by,
        offset,
        page_size,
        limit: staged.limit,
    })
}

/// Pages every builder query and trace operator of `composite` in lockstep.
pub fn paginate_composite(
    composite: &CompositeQuery,
    anchor_log_id: Option<&str>,
    order_by_timestamp: &OrderBy,
    page: i64,
    page_size: i64,
) -> Result<CompositeQuery> {
    let page_all = |queries: &[BuilderQuery]| -> Result<Vec<BuilderQuery>> {
        queries
            .iter()
            .map(|query| {
                paginate(query, anchor_log_id, order_by_timestamp, page, page_size)
                    .map(|paged| paged.apply_to(query))
            })
            .collect()
    };

    let mut next = composite.clone();
    next.builder.query_data = page_all(&composite.builder.query_data)?;
    next.builder.query_trace_operator = page_all(&composite.builder.query_trace_operator)?;
    Ok(next)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTokens {
    pub next_cursor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_cursor: Option<String>,
}

impl PageTokens {
    pub fn around(offset: i64, page_size: i64) -> Result<Self> {
        let page_size = page_size.max(1);
        let next = offset.checked_add(page_size).ok_or_else(offset_overflow)?;
        let prev_cursor = if offset > 0 {
            Some(encode_cursor(offset.saturating_sub(page_size))?)
        } else {
            None
        };
        Ok(Self {
            next_cursor: encode_cursor(next)?,
            prev_cursor,
        })
    }
}

/// Page number addressed by a cursor offset.
pub fn page_for_offset(offset: i64, page_size: i64) -> Result<i64> {
    (offset.max(0) / page_size.max(1))
        .checked_add(1)
        .ok_or_else(offset_overflow)
}
