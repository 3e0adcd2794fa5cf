use super::source::InhibitSource;
use super::value_object::{SourceRole, StateUpdate};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HolderError {
    #[error("source not found: {0}")]
    NotFound(String),
}

/// Ordered collection of inhibit sources.
///
/// Sources are kept sorted by [`SourceRole::priority`]; sources of equal rank
/// keep their insertion order. A source that is removed and re-appended after
/// a restart therefore lands back in the same slot.
#[derive(Default)]
pub struct InhibitHolder {
    sources: RwLock<Vec<Arc<InhibitSource>>>,
    generation: AtomicU64,
}

impl InhibitHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, source: Arc<InhibitSource>) {
        let mut sources = self.sources.write();
        let rank = source.role().priority();
        let index = sources
            .iter()
            .position(|existing| existing.role().priority() > rank)
            .unwrap_or(sources.len());
        sources.insert(index, source);
        self.bump();
    }

    pub fn remove_by_name(&self, name: &str) -> Result<Arc<InhibitSource>, HolderError> {
        let mut sources = self.sources.write();
        let index = sources
            .iter()
            .position(|source| source.name() == name)
            .ok_or_else(|| HolderError::NotFound(name.to_string()))?;
        let removed = sources.remove(index);
        self.bump();
        Ok(removed)
    }

    /// Removes every source carrying `role`, returning the removed instances.
    pub fn remove_by_role(&self, role: SourceRole) -> Vec<Arc<InhibitSource>> {
        let mut sources = self.sources.write();
        let mut removed = Vec::new();
        sources.retain(|source| {
            if source.role() == role {
                removed.push(Arc::clone(source));
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.bump();
        }
        removed
    }

    /// Removes exactly this instance, leaving any replacement for the same
    /// role untouched.
    pub fn remove_instance(&self, target: &Arc<InhibitSource>) -> bool {
        let mut sources = self.sources.write();
        let before = sources.len();
        sources.retain(|source| !Arc::ptr_eq(source, target));
        let removed = sources.len() != before;
        if removed {
            self.bump();
        }
        removed
    }

    /// Bumped on every append and removal. Lets observers notice a replaced
    /// source even when the aggregate decision is unchanged.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<InhibitSource>> {
        self.sources
            .read()
            .iter()
            .find(|source| source.name() == name)
            .cloned()
    }

    pub fn get_by_role(&self, role: SourceRole) -> Option<Arc<InhibitSource>> {
        self.sources
            .read()
            .iter()
            .find(|source| source.role() == role)
            .cloned()
    }

    /// Applies `update` to every source and raises each change event.
    pub fn update_state(&self, update: &StateUpdate) {
        for source in self.sources.read().iter() {
            source.apply(update);
            source.change_event().set();
        }
    }

    /// Applies `update` to every source without waking observers.
    pub fn silent_update_state(&self, update: &StateUpdate) {
        for source in self.sources.read().iter() {
            source.apply(update);
        }
    }

    /// Raises every change event without touching data.
    pub fn refresh_state(&self) {
        for source in self.sources.read().iter() {
            source.change_event().set();
        }
    }

    pub fn request_shutdown(&self) {
        for source in self.sources.read().iter() {
            source.request_shutdown();
        }
    }

    /// Point-in-time copy of the ordered source list.
    pub fn sources(&self) -> Vec<Arc<InhibitSource>> {
        self.sources.read().clone()
    }

    pub fn dump_names(&self) -> Vec<String> {
        self.sources
            .read()
            .iter()
            .map(|source| source.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}
