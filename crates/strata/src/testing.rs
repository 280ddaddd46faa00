//! Test utilities for strata - shared fixtures and mocks
//!
//! Scripted extraction agents and an in-memory engine builder so unit
//! and integration tests exercise the pipeline without a network or an
//! on-disk database.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::config::Config;
use crate::consolidation::ExtractionAgent;
use crate::consolidation::types::{ExtractionRequest, ExtractionResponse};
use crate::embedding::HashEmbedder;
use crate::error::{MemoryError, Result};
use crate::service::MemoryService;
use crate::storage::MemoryStore;

/// In-memory memory service for tests.
pub fn test_service() -> MemoryService {
    MemoryService::new(
        Arc::new(MemoryStore::open_in_memory().expect("in-memory store")),
        Arc::new(HashEmbedder::new()),
        Config::default(),
    )
}

/// Scripted extraction agent.
///
/// Returns a fixed response, a fixed failure, or a per-source mix, and
/// counts its invocations so tests can assert retry behavior.
pub struct StaticAgent {
    response: ExtractionResponse,
    fail_message: Option<String>,
    fail_source: Option<String>,
    calls: AtomicUsize,
}

impl StaticAgent {
    /// Always return the given response.
    pub fn returning(response: ExtractionResponse) -> Self {
        Self {
            response,
            fail_message: None,
            fail_source: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always fail with a retryable extraction error.
    pub fn failing(message: &str) -> Self {
        Self {
            response: ExtractionResponse::default(),
            fail_message: Some(message.to_string()),
            fail_source: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail only for one source; return the response for every other.
    pub fn failing_for_source(source: &str, response: ExtractionResponse) -> Self {
        Self {
            response,
            fail_message: None,
            fail_source: Some(source.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionAgent for StaticAgent {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_message {
            return Err(MemoryError::Extraction(message.clone()));
        }
        if self.fail_source.as_deref() == Some(request.source.as_str()) {
            return Err(MemoryError::Extraction(format!(
                "scripted failure for source '{}'",
                request.source
            )));
        }
        Ok(self.response.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
