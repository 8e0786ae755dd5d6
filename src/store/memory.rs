//! In-Memory Resource Store
//!
//! DashMap-backed implementation of the [`ResourceStore`] port with real
//! resource-version checks. Used for standalone mode and as the fake
//! cluster in tests, where conflicts can be injected on demand.

use crate::domain::ports::{ListFilter, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use kube::Resource;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// In-memory store for one kind of resource
pub struct MemoryStore<K> {
    kind: String,
    /// Objects by name
    objects: DashMap<String, K>,
    /// Monotonic resource version source
    version: AtomicU64,
    /// Number of upcoming updates to reject with a conflict
    pending_conflicts: AtomicU32,
    /// Number of upcoming updates that store everything but metadata and
    /// then report a conflict
    pending_split_writes: AtomicU32,
    /// Successful create/update calls
    writes: AtomicU64,
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            kind: K::kind(&K::DynamicType::default()).to_string(),
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            pending_conflicts: AtomicU32::new(0),
            pending_split_writes: AtomicU32::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Seed an object without counting it as a write
    pub fn insert(&self, mut object: K) -> K {
        let name = object.meta().name.clone().unwrap_or_default();
        object.meta_mut().resource_version = Some(self.next_version());
        self.objects.insert(name, object.clone());
        object
    }

    /// Reject the next `count` updates with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Let the next `count` updates persist their status but not their
    /// metadata before failing with a conflict
    pub fn inject_split_writes(&self, count: u32) {
        self.pending_split_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful create/update calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current copy of an object, if present
    pub fn snapshot(&self, name: &str) -> Option<K> {
        self.objects.get(name).map(|o| o.clone())
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected_conflict(&self) -> bool {
        take_one(&self.pending_conflicts)
    }

    fn take_split_write(&self) -> bool {
        take_one(&self.pending_split_writes)
    }

    fn conflict(&self, name: &str) -> Error {
        Error::Conflict {
            kind: self.kind.clone(),
            name: name.to_string(),
        }
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.objects
            .get(name)
            .map(|o| o.clone())
            .ok_or_else(|| Error::ResourceNotFound {
                kind: self.kind.clone(),
                name: name.to_string(),
            })
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<K>> {
        let mut items: Vec<K> = self
            .objects
            .iter()
            .filter(|entry| filter.matches(entry.value().meta().labels.as_ref()))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        Ok(items)
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::Internal(format!("{} without a name", self.kind)))?;

        let mut created = object.clone();
        created.meta_mut().resource_version = Some(self.next_version());

        match self.objects.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::ResourceExists {
                kind: self.kind.clone(),
                name,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(created.clone());
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(created)
            }
        }
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = object.meta().name.clone().unwrap_or_default();

        if self.take_injected_conflict() {
            return Err(self.conflict(&name));
        }

        let mut current = self.objects.get_mut(&name).ok_or_else(|| Error::ResourceNotFound {
            kind: self.kind.clone(),
            name: name.clone(),
        })?;

        if current.meta().resource_version != object.meta().resource_version {
            return Err(self.conflict(&name));
        }

        if self.take_split_write() {
            let mut partial = object.clone();
            *partial.meta_mut() = current.meta().clone();
            partial.meta_mut().resource_version = Some(self.next_version());
            *current = partial;
            self.writes.fetch_add(1, Ordering::SeqCst);
            return Err(self.conflict(&name));
        }

        let mut updated = object.clone();
        updated.meta_mut().resource_version = Some(self.next_version());
        *current = updated.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Drive, DriveSpec, DriveStatus};
    use assert_matches::assert_matches;

    fn drive(name: &str, node: &str) -> Drive {
        let mut drive = Drive::new(name, DriveSpec::default());
        drive.set_label("node", node);
        drive
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let store = MemoryStore::<Drive>::new();
        store.create(&drive("d1", "n1")).await.unwrap();
        store.create(&drive("d2", "n2")).await.unwrap();

        assert_eq!(store.get("d1").await.unwrap().name(), "d1");
        assert_matches!(store.get("d3").await, Err(Error::ResourceNotFound { .. }));
        assert_matches!(
            store.create(&drive("d1", "n1")).await,
            Err(Error::ResourceExists { .. })
        );

        let listed = store.list(&ListFilter::new().label("node", "n2")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "d2");
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::<Drive>::new();
        let seeded = store.insert(drive("d1", "n1"));

        let first = store.update(&seeded).await.unwrap();
        assert_ne!(first.metadata.resource_version, seeded.metadata.resource_version);

        let err = store.update(&seeded).await.unwrap_err();
        assert!(err.is_conflict());

        store.update(&first).await.unwrap();
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let store = MemoryStore::<Drive>::new();
        let seeded = store.insert(drive("d1", "n1"));
        store.inject_conflicts(2);

        assert!(store.update(&seeded).await.unwrap_err().is_conflict());
        assert!(store.update(&seeded).await.unwrap_err().is_conflict());
        store.update(&seeded).await.unwrap();
    }

    #[tokio::test]
    async fn test_split_write_keeps_old_metadata() {
        let store = MemoryStore::<Drive>::new();
        let seeded = store.insert(drive("d1", "n1"));
        store.inject_split_writes(1);

        let mut changed = seeded.clone();
        changed.set_label("node", "n2");
        changed.status = Some(DriveStatus {
            free_capacity: 42,
            ..Default::default()
        });
        assert!(store.update(&changed).await.unwrap_err().is_conflict());

        let stored = store.snapshot("d1").unwrap();
        assert_eq!(stored.metadata.labels.as_ref().unwrap()["node"], "n1");
        assert_eq!(stored.status.as_ref().unwrap().free_capacity, 42);
        assert_ne!(stored.metadata.resource_version, seeded.metadata.resource_version);

        // stale now; a fresh read goes through
        assert!(store.update(&changed).await.unwrap_err().is_conflict());
        let mut fresh = stored.clone();
        fresh.set_label("node", "n2");
        store.update(&fresh).await.unwrap();
        let stored = store.snapshot("d1").unwrap();
        assert_eq!(stored.metadata.labels.as_ref().unwrap()["node"], "n2");
    }
}
