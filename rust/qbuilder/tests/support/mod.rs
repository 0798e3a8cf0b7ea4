use axum::{
    body::{self, Body},
    Router,
};
use http::{Request, StatusCode};
use qbuilder::{config::AppConfig, server::Server};
use serde::Serialize;
use serde_json::Value;
use std::sync::Once;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// In-process composition service with an API key configured.
pub struct ComposerHarness {
    router: Router,
}

impl ComposerHarness {
    pub fn new() -> Self {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });
        let server = Server::new(AppConfig::embedded(Some(API_KEY.to_string())));
        Self {
            router: server.router(),
        }
    }

    pub async fn post<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize,
    {
        self.request("POST", path, Some(payload), true).await
    }

    #[allow(dead_code)]
    pub async fn post_without_api_key<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize,
    {
        self.request("POST", path, Some(payload), false).await
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.request::<Value>("GET", path, None, false).await
    }

    async fn request<T>(
        &self,
        method: &str,
        path: &str,
        payload: Option<&T>,
        include_api_key: bool,
    ) -> http::Response<Body>
    where
        T: Serialize,
    {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");

        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }

        let body = match payload {
            Some(payload) => {
                Body::from(serde_json::to_vec(payload).expect("request payload should serialize"))
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("request should build");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
