use super::{extended, ObjectDescriptor, ObjectKind, State, StateChange, StateStore};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

const CHANGE_CAPACITY: usize = 1024;

/// In-process store. Counts mutating writes; a write that leaves the tree
/// unchanged is not counted.
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, ObjectDescriptor>>,
    states: RwLock<BTreeMap<String, State>>,
    mutations: AtomicU64,
    changes: broadcast::Sender<StateChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            states: RwLock::new(BTreeMap::new()),
            mutations: AtomicU64::new(0),
            changes,
        }
    }

    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Object ids and state values, without timestamps.
    pub async fn dump(&self) -> (BTreeMap<String, ObjectDescriptor>, BTreeMap<String, Value>) {
        let objects = self.objects.read().await.clone();
        let states = self
            .states
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.val.clone()))
            .collect();
        (objects, states)
    }

    pub async fn object_ids(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_object(&self, id: &str) -> Result<Option<ObjectDescriptor>> {
        Ok(self.objects.read().await.get(id).cloned())
    }

    async fn set_object(&self, id: &str, obj: ObjectDescriptor) -> Result<()> {
        let mut objects = self.objects.write().await;
        if objects.get(id) != Some(&obj) {
            objects.insert(id.to_string(), obj);
            self.mutated();
        }
        Ok(())
    }

    async fn set_object_not_exists(&self, id: &str, obj: ObjectDescriptor) -> Result<bool> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(id) {
            return Ok(false);
        }
        objects.insert(id.to_string(), obj);
        self.mutated();
        Ok(true)
    }

    async fn extend_object(&self, id: &str, partial: Value) -> Result<()> {
        let mut objects = self.objects.write().await;
        let merged = extended(objects.get(id), &partial)?;
        if objects.get(id) != Some(&merged) {
            objects.insert(id.to_string(), merged);
            self.mutated();
        }
        Ok(())
    }

    async fn delete_object(&self, id: &str) -> Result<()> {
        let removed = self.objects.write().await.remove(id).is_some();
        let removed_state = self.states.write().await.remove(id).is_some();
        if removed || removed_state {
            self.mutated();
        }
        Ok(())
    }

    async fn get_state(&self, id: &str) -> Result<Option<State>> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn set_state(&self, id: &str, val: Value, ack: bool) -> Result<()> {
        let state = State::new(val, ack);
        self.states.write().await.insert(id.to_string(), state.clone());
        self.mutated();
        // no receivers is fine
        let _ = self.changes.send(StateChange {
            id: id.to_string(),
            state,
        });
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        kind: Option<ObjectKind>,
    ) -> Result<Vec<(String, ObjectDescriptor)>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .filter(|(_, obj)| kind.map_or(true, |k| obj.kind == k))
            .map(|(id, obj)| (id.clone(), obj.clone()))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}
