//! The object-store interface and its in-memory implementation.
//!
//! The store serializes writes per object via optimistic concurrency
//! (resource version) and owns the `uid`/`generation`/`resource_version`
//! fields. Every write runs the admission chain and the kind's strategy
//! synchronously before anything is persisted; watch subscribers observe
//! committed writes in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use trellis_api::{ObjectKey, ValidationErrors};
use uuid::Uuid;

use crate::admission::{AdmissionChain, AdmissionRequest};
use crate::error::StoreError;
use crate::object::{Selector, StoredObject, WatchEvent};
use crate::principal::Principal;
use crate::strategy::Strategy;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// The versioned, watched object API the core consumes.
///
/// Writes carry the authenticated [`Principal`] so the admission chain can
/// enforce per-signer and per-requester policy.
#[async_trait]
pub trait ObjectStore<T: StoredObject>: Send + Sync {
    /// Create a new object. Runs admission and validation; the store
    /// assigns `uid`, `generation = 1`, and a fresh resource version.
    async fn create(&self, principal: &Principal, obj: T) -> Result<T, StoreError>;

    /// Update the main resource. Status changes are discarded; the spec
    /// generation bumps when the spec changed.
    async fn update(&self, principal: &Principal, obj: T) -> Result<T, StoreError>;

    /// Update the status subresource. Spec changes are discarded.
    async fn update_status(&self, principal: &Principal, obj: T) -> Result<T, StoreError>;

    /// Fetch one object by key.
    async fn get(&self, key: &ObjectKey) -> Result<T, StoreError>;

    /// List objects matching the selector.
    async fn list(&self, selector: &Selector) -> Result<Vec<T>, StoreError>;

    /// Delete one object by key.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Subscribe to the committed-write event stream.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

/// In-memory [`ObjectStore`] with admission and strategy hooks.
pub struct MemoryStore<T: StoredObject> {
    objects: RwLock<HashMap<ObjectKey, T>>,
    strategy: Box<dyn Strategy<T>>,
    admission: AdmissionChain<T>,
    events: broadcast::Sender<WatchEvent<T>>,
    next_resource_version: AtomicU64,
}

impl<T: StoredObject> MemoryStore<T> {
    /// A store with the given strategy and admission chain.
    pub fn new(strategy: Box<dyn Strategy<T>>, admission: AdmissionChain<T>) -> Arc<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Arc::new(Self {
            objects: RwLock::new(HashMap::new()),
            strategy,
            admission,
            events,
            next_resource_version: AtomicU64::new(1),
        })
    }

    fn next_rv(&self) -> u64 {
        self.next_resource_version.fetch_add(1, Ordering::SeqCst)
    }

    fn invalid(errors: ValidationErrors) -> StoreError {
        StoreError::Invalid {
            kind: T::KIND,
            errors,
        }
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            key: key.to_string(),
        }
    }

    fn conflict(key: &ObjectKey) -> StoreError {
        StoreError::Conflict {
            kind: T::KIND,
            key: key.to_string(),
        }
    }

    fn current(&self, key: &ObjectKey) -> Result<T, StoreError> {
        self.objects
            .read()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    /// Enforce the kind's scope before any hook runs.
    fn check_scope(obj: &T) -> Result<(), StoreError> {
        let namespace = &obj.metadata().namespace;
        let err = if T::NAMESPACED && namespace.is_empty() {
            Some(trellis_api::FieldError::required("metadata.namespace"))
        } else if !T::NAMESPACED && !namespace.is_empty() {
            Some(trellis_api::FieldError::invalid(
                "metadata.namespace",
                format!("{} is cluster-scoped", T::KIND),
            ))
        } else {
            None
        };
        match err {
            Some(err) => Err(Self::invalid(err.into())),
            None => Ok(()),
        }
    }

    fn check_incoming_version(incoming: &T, stored: &T, key: &ObjectKey) -> Result<(), StoreError> {
        let incoming_rv = incoming.metadata().resource_version;
        if incoming_rv != 0 && incoming_rv != stored.metadata().resource_version {
            return Err(Self::conflict(key));
        }
        Ok(())
    }

    /// Commit a prepared object, re-checking under the write lock that no
    /// concurrent writer advanced the object since `old` was read.
    fn commit(&self, key: &ObjectKey, old: &T, mut prepared: T) -> Result<T, StoreError> {
        let mut objects = self.objects.write().expect("store lock poisoned");
        let current = objects.get(key).ok_or_else(|| Self::not_found(key))?;
        if current.metadata().resource_version != old.metadata().resource_version {
            return Err(Self::conflict(key));
        }
        prepared.metadata_mut().resource_version = self.next_rv();
        objects.insert(key.clone(), prepared.clone());
        drop(objects);

        let _ = self.events.send(WatchEvent::Modified(prepared.clone()));
        Ok(prepared)
    }
}

#[async_trait]
impl<T: StoredObject> ObjectStore<T> for MemoryStore<T> {
    async fn create(&self, principal: &Principal, mut obj: T) -> Result<T, StoreError> {
        obj.clear_status();
        Self::check_scope(&obj)?;

        let req = AdmissionRequest::create(principal.clone());
        self.admission.admit(&req, &mut obj, None)?;
        self.strategy
            .prepare_for_create(&mut obj)
            .map_err(Self::invalid)?;
        self.strategy.validate_create(&obj).map_err(Self::invalid)?;

        let key = obj.key();
        let mut objects = self.objects.write().expect("store lock poisoned");
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                key: key.to_string(),
            });
        }

        {
            let meta = obj.metadata_mut();
            meta.uid = Uuid::new_v4().to_string();
            meta.generation = 1;
            meta.creation_timestamp = Some(Utc::now());
        }
        obj.metadata_mut().resource_version = self.next_rv();
        objects.insert(key, obj.clone());
        drop(objects);

        let _ = self.events.send(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, principal: &Principal, obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let old = self.current(&key)?;
        Self::check_incoming_version(&obj, &old, &key)?;

        // The main resource never writes status, and the store owns the
        // identity fields.
        let mut merged = obj;
        merged.copy_status_from(&old);
        {
            let old_meta = old.metadata();
            let meta = merged.metadata_mut();
            meta.uid = old_meta.uid.clone();
            meta.generation = old_meta.generation;
            meta.creation_timestamp = old_meta.creation_timestamp;
            meta.resource_version = old_meta.resource_version;
        }

        let req = AdmissionRequest::update(principal.clone());
        self.admission.admit(&req, &mut merged, Some(&old))?;
        self.strategy
            .prepare_for_update(&mut merged, &old)
            .map_err(Self::invalid)?;
        self.strategy
            .validate_update(&merged, &old)
            .map_err(Self::invalid)?;

        if !merged.spec_equals(&old) {
            merged.metadata_mut().generation += 1;
        }

        self.commit(&key, &old, merged)
    }

    async fn update_status(&self, principal: &Principal, obj: T) -> Result<T, StoreError> {
        if !T::HAS_STATUS {
            return Err(StoreError::NoStatusSubresource(T::KIND));
        }

        let key = obj.key();
        let old = self.current(&key)?;
        Self::check_incoming_version(&obj, &old, &key)?;

        // Status writes cannot touch spec or metadata.
        let mut merged = old.clone();
        merged.copy_status_from(&obj);

        let req = AdmissionRequest::update_status(principal.clone());
        self.admission.admit(&req, &mut merged, Some(&old))?;
        self.strategy
            .validate_status_update(&merged, &old)
            .map_err(Self::invalid)?;

        self.commit(&key, &old, merged)
    }

    async fn get(&self, key: &ObjectKey) -> Result<T, StoreError> {
        self.current(key)
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<T>, StoreError> {
        let objects = self.objects.read().expect("store lock poisoned");
        let mut matched = Vec::new();
        'outer: for obj in objects.values() {
            if !selector.labels.matches(&obj.metadata().labels) {
                continue;
            }
            for (label, value) in &selector.fields {
                let actual = obj.field(label).ok_or_else(|| {
                    StoreError::UnsupportedFieldLabel {
                        kind: T::KIND,
                        label: label.clone(),
                    }
                })?;
                if actual != *value {
                    continue 'outer;
                }
            }
            matched.push(obj.clone());
        }
        matched.sort_by_key(|obj| obj.key());
        Ok(matched)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let removed = self
            .objects
            .write()
            .expect("store lock poisoned")
            .remove(key)
            .ok_or_else(|| Self::not_found(key))?;
        let _ = self.events.send(WatchEvent::Deleted(removed));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}
