use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use leadflow_core::domain::conversation::{ConversationState, ThreadId};
use leadflow_core::ports::{CheckpointStore, PortError};

/// Process-local checkpoints for tests and `sqlite::memory:` runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    states: RwLock<HashMap<ThreadId, ConversationState>>,
}

impl InMemoryCheckpointStore {
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, PortError> {
        let states = self.states.read().await;
        Ok(states.get(thread_id).cloned())
    }

    async fn put(&self, state: &ConversationState) -> Result<(), PortError> {
        let mut states = self.states.write().await;
        states.insert(state.thread_id.clone(), state.clone());
        Ok(())
    }
}
