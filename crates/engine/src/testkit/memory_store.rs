//! In-memory scenario store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::store::{ScenarioStore, StoreError, StoredScenario};

/// Map-backed [`ScenarioStore`] for tests and ad hoc runs.
#[derive(Default)]
pub struct MemoryScenarioStore {
    scenarios: DashMap<String, StoredScenario>,
}

impl MemoryScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a scenario under the given id, replacing any existing one.
    pub fn insert(&self, id: &str, name: &str, flow_data: &str) {
        let now = Utc::now();
        self.scenarios.insert(
            id.to_string(),
            StoredScenario {
                id: id.to_string(),
                project_id: "default".to_string(),
                name: name.to_string(),
                flow_data: flow_data.to_string(),
                created_at: now,
                updated_at: now,
            },
        );
    }
}

#[async_trait]
impl ScenarioStore for MemoryScenarioStore {
    async fn load(&self, scenario_id: &str) -> Result<StoredScenario, StoreError> {
        self.scenarios
            .get(scenario_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(scenario_id.to_string()))
    }
}
