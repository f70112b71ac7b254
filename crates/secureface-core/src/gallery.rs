//! The enrolled set of people and their reference embeddings.
//!
//! A [`Gallery`] is immutable once built. Re-enrollment builds a new one and
//! publishes it through [`GalleryHandle::replace`], so a match in flight keeps
//! the snapshot it started with.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// A role and the access level it carries (higher = more privileged).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub access_level: i32,
}

/// One enrolled person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person_id: i64,
    pub display_name: String,
    pub role: Role,
    /// At least one reference embedding; an entry's score is the max over them.
    pub references: Vec<Embedding>,
}

#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Build a gallery, dropping entries that carry no reference embedding.
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        let (entries, empty): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| !e.references.is_empty());
        for e in &empty {
            tracing::debug!(person_id = e.person_id, "gallery entry has no reference embeddings; skipped");
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of reference embeddings across all entries.
    pub fn reference_count(&self) -> usize {
        self.entries.iter().map(|e| e.references.len()).sum()
    }
}

/// Shared pointer to the current gallery snapshot.
#[derive(Clone, Default)]
pub struct GalleryHandle {
    current: Arc<RwLock<Arc<Gallery>>>,
}

impl GalleryHandle {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(gallery))),
        }
    }

    /// The gallery as of now. Later replacements do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<Gallery> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Publish a new gallery snapshot.
    pub fn replace(&self, gallery: Gallery) {
        let next = Arc::new(gallery);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(person_id: i64, refs: usize) -> GalleryEntry {
        GalleryEntry {
            person_id,
            display_name: format!("person {person_id}"),
            role: Role { id: 1, name: "Employee".into(), access_level: 10 },
            references: (0..refs)
                .map(|_| Embedding { values: vec![1.0, 0.0], model_version: None })
                .collect(),
        }
    }

    #[test]
    fn test_entries_without_references_are_dropped() {
        let g = Gallery::new(vec![entry(1, 2), entry(2, 0), entry(3, 1)]);
        assert_eq!(g.len(), 2);
        assert_eq!(g.reference_count(), 3);
        assert!(g.entries().iter().all(|e| e.person_id != 2));
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let handle = GalleryHandle::new(Gallery::new(vec![entry(1, 1)]));
        let before = handle.snapshot();
        handle.replace(Gallery::new(vec![entry(1, 1), entry(2, 1)]));
        assert_eq!(before.len(), 1);
        assert_eq!(handle.snapshot().len(), 2);
    }
}
