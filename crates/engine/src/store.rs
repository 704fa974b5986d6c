//! Scenario persistence seam.
//!
//! The engine loads a scenario's flow document by id through this trait.
//! `sipflow-scenario-store` provides the SQLite-backed implementation;
//! [`crate::testkit::MemoryScenarioStore`] backs tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A persisted scenario: identity plus the raw flow document JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredScenario {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub flow_data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Failures from a scenario store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scenario not found: {0}")]
    NotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("scenario store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Read access to persisted scenarios, as the engine needs it.
#[async_trait]
pub trait ScenarioStore: Send + Sync {
    /// Load one scenario by id.
    async fn load(&self, scenario_id: &str) -> Result<StoredScenario, StoreError>;
}
