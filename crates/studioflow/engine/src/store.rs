//! Execution persistence: the storage collaborator
//!
//! Saves are guarded by optimistic concurrency: each save must present the
//! version it loaded; a stale version is rejected with `Conflict` so a
//! read taken before another writer's save can never clobber it.

use async_trait::async_trait;
use std::collections::HashMap;
use studioflow_types::{ExecutionId, WorkflowError, WorkflowExecution, WorkflowResult};
use tokio::sync::RwLock;

/// Load/save surface for workflow executions
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Load an execution by id
    async fn load(&self, id: &ExecutionId) -> WorkflowResult<WorkflowExecution>;

    /// Persist an execution. The execution's `version` must equal the
    /// stored version; on success the version is bumped in place.
    async fn save(&self, execution: &mut WorkflowExecution) -> WorkflowResult<()>;

    /// All executions not yet in a terminal status
    async fn list_non_terminal(&self) -> WorkflowResult<Vec<WorkflowExecution>>;
}

/// In-memory store for tests and embedding
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.executions.read().await.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn load(&self, id: &ExecutionId) -> WorkflowResult<WorkflowExecution> {
        self.executions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::ExecutionNotFound(id.clone()))
    }

    async fn save(&self, execution: &mut WorkflowExecution) -> WorkflowResult<()> {
        let mut executions = self.executions.write().await;
        if let Some(stored) = executions.get(&execution.id) {
            if stored.version != execution.version {
                return Err(WorkflowError::Conflict(execution.id.clone()));
            }
        }
        execution.version += 1;
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn list_non_terminal(&self) -> WorkflowResult<Vec<WorkflowExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studioflow_types::{ExecutionStatus, StudioId, TemplateId, UserId};

    fn make_execution() -> WorkflowExecution {
        WorkflowExecution::new(
            TemplateId::new("t-1"),
            StudioId::new("studio-1"),
            UserId::new("u-1"),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryExecutionStore::new();
        let mut execution = make_execution();
        store.save(&mut execution).await.unwrap();
        assert_eq!(execution.version, 1);

        let loaded = store.load(&execution.id).await.unwrap();
        assert_eq!(loaded.id, execution.id);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = InMemoryExecutionStore::new();
        let result = store.load(&ExecutionId::new("ghost")).await;
        assert!(matches!(result, Err(WorkflowError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = InMemoryExecutionStore::new();
        let mut execution = make_execution();
        store.save(&mut execution).await.unwrap();

        // two readers load the same version
        let mut first = store.load(&execution.id).await.unwrap();
        let mut second = store.load(&execution.id).await.unwrap();

        store.save(&mut first).await.unwrap();

        // the second writer's version is now stale
        let result = store.save(&mut second).await;
        assert!(matches!(result, Err(WorkflowError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_list_non_terminal() {
        let store = InMemoryExecutionStore::new();

        let mut running = make_execution();
        running.status = ExecutionStatus::Running;
        store.save(&mut running).await.unwrap();

        let mut done = make_execution();
        done.status = ExecutionStatus::Completed;
        store.save(&mut done).await.unwrap();

        let open = store.list_non_terminal().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, running.id);
        assert_eq!(store.count().await, 2);
    }
}
