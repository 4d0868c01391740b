//! Shared helpers for HTTP tests

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use codedrop_server::config::Config;
use codedrop_server::routes;
use codedrop_server::state::AppState;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// Router over a fresh data directory
pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    pub config: Config,
    _temp_dir: TempDir,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().to_path_buf();
        customize(&mut config);

        let state = AppState::new(config.clone())
            .await
            .expect("Failed to create app state");
        let router = routes::router(state.clone());

        Self {
            router,
            state,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Send a request and collect the raw response
    pub async fn send(&self, method: &str, uri: &str, body: Vec<u8>) -> TestResponse {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn post(&self, uri: &str) -> (StatusCode, Value) {
        self.send("POST", uri, Vec::new()).await.json()
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send("GET", uri, Vec::new()).await.json()
    }

    pub async fn start(&self, filename: &str, file_size: u64) -> (StatusCode, Value) {
        self.post(&format!(
            "/upload/start?filename={}&file_size={}",
            urlencoding::encode(filename),
            file_size
        ))
        .await
    }

    pub async fn chunk(
        &self,
        file_id: &str,
        chunk_id: usize,
        token: &str,
        data: &[u8],
    ) -> (StatusCode, Value) {
        self.send(
            "POST",
            &format!(
                "/upload/chunk?file_id={}&chunk_id={}&token={}",
                file_id, chunk_id, token
            ),
            data.to_vec(),
        )
        .await
        .json()
    }

    pub async fn finish(&self, file_id: &str, token: &str) -> (StatusCode, Value) {
        self.post(&format!("/upload/finish?file_id={}&token={}", file_id, token))
            .await
    }

    /// Upload `data` in full and return the share code
    pub async fn share(&self, filename: &str, data: &[u8]) -> String {
        let (status, started) = self.start(filename, data.len() as u64).await;
        assert_eq!(status, StatusCode::OK, "start failed: {}", started);

        let file_id = started["fileId"].as_str().unwrap().to_string();
        let token = started["token"].as_str().unwrap().to_string();
        let chunk_size = started["chunkSize"].as_u64().unwrap() as usize;

        for (chunk_id, chunk) in data.chunks(chunk_size).enumerate() {
            let (status, body) = self.chunk(&file_id, chunk_id, &token, chunk).await;
            assert_eq!(status, StatusCode::OK, "chunk failed: {}", body);
        }

        let (status, finished) = self.finish(&file_id, &token).await;
        assert_eq!(status, StatusCode::OK, "finish failed: {}", finished);
        finished["code"].as_str().unwrap().to_string()
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(self) -> (StatusCode, Value) {
        let value = if self.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&self.body).unwrap_or(Value::Null)
        };
        (self.status, value)
    }
}

/// Deterministic test payload
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
