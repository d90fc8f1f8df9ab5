#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;

use payslip_pipeline::db::Pool;
use payslip_pipeline::inference::{ExtractionPayload, InferenceError, InferenceService};
use payslip_pipeline::storage::PreviewStore;
use payslip_pipeline::worker::{Worker, WorkerSettings};

pub const USER: &str = "user-1";

/// Every in-memory connection is its own database, so keep exactly one.
pub async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Default)]
pub struct FakePreviews {
    pub files: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub fail_with: Mutex<Option<String>>,
    pub delay: Option<Duration>,
}

impl FakePreviews {
    pub fn with(user_id: &str, file_ids: &[&str]) -> Self {
        let store = Self::default();
        for file_id in file_ids {
            store.put(user_id, file_id, b"\x89PNG fake");
        }
        store
    }

    pub fn put(&self, user_id: &str, file_id: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert((user_id.to_string(), file_id.to_string()), bytes.to_vec());
    }
}

#[async_trait]
impl PreviewStore for FakePreviews {
    async fn fetch_preview(&self, user_id: &str, file_id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = self.fail_with.lock().unwrap().clone() {
            anyhow::bail!(msg);
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), file_id.to_string()))
            .cloned())
    }
}

/// Hands out queued responses in order and records every image it saw.
#[derive(Default)]
pub struct FakeInference {
    pub responses: Mutex<VecDeque<Result<ExtractionPayload, InferenceError>>>,
    pub calls: Mutex<Vec<Vec<u8>>>,
    pub delay: Option<Duration>,
}

impl FakeInference {
    pub fn replying(responses: Vec<Result<ExtractionPayload, InferenceError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceService for FakeInference {
    async fn extract(&self, image_png: &[u8]) -> Result<ExtractionPayload, InferenceError> {
        self.calls.lock().unwrap().push(image_png.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(InferenceError::MissingOutput))
    }
}

pub fn payload(value: Value) -> ExtractionPayload {
    serde_json::from_value(value).unwrap()
}

pub fn worker(
    pool: &Pool,
    previews: Arc<FakePreviews>,
    inference: Arc<FakeInference>,
) -> Worker {
    Worker::new(pool.clone(), previews, inference, WorkerSettings::default())
}
