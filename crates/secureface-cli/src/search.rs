//! Top-k search of the enrolled gallery for a query face.

use anyhow::Result;
use secureface_core::{CosineMatcher, Embedding, Gallery};
use secureface_store::Store;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub rank: usize,
    pub person_id: i64,
    pub full_name: String,
    pub role: String,
    pub access_level: i32,
    pub department: Option<String>,
    /// Best similarity over the person's references.
    pub similarity: f32,
}

/// The `k` enrolled people closest to `query`, best first.
pub fn search(store: &Store, gallery: &Gallery, query: &Embedding, k: usize) -> Result<Vec<SearchHit>> {
    CosineMatcher
        .top_k(query, gallery, k)
        .into_iter()
        .enumerate()
        .map(|(rank, (idx, similarity))| {
            let entry = &gallery.entries()[idx];
            let department = store.get_user(entry.person_id)?.department;
            Ok(SearchHit {
                rank: rank + 1,
                person_id: entry.person_id,
                full_name: entry.display_name.clone(),
                role: entry.role.name.clone(),
                access_level: entry.role.access_level,
                department,
                similarity,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secureface_core::EMBEDDING_DIM;

    fn unit(axis: usize, weight: f32) -> Embedding {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = weight;
        v[axis] += (1.0 - weight * weight).sqrt();
        Embedding::from_raw(v, None)
    }

    #[test]
    fn test_search_ranks_enrolled_people() {
        let store = Store::open_in_memory().unwrap();
        let admin = store.role_by_name("Admin").unwrap().role.id;
        let employee = store.role_by_name("Employee").unwrap().role.id;

        let near = store.create_user("Near", employee, Some("Ops")).unwrap().id;
        let far = store.create_user("Far", admin, None).unwrap().id;
        let mid = store.create_user("Mid", admin, None).unwrap().id;
        store.add_embedding(near, &unit(1, 0.9)).unwrap();
        store.add_embedding(far, &unit(2, 0.1)).unwrap();
        store.add_embedding(mid, &unit(3, 0.5)).unwrap();
        // A second, closer reference lifts Mid above its first one.
        store.add_embedding(mid, &unit(4, 0.7)).unwrap();

        let gallery = store.load_gallery().unwrap();
        let hits = search(&store, &gallery, &unit(0, 1.0), 2).unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].rank, hits[0].person_id), (1, near));
        assert_eq!(hits[0].department.as_deref(), Some("Ops"));
        assert_eq!(hits[0].role, "Employee");
        assert!((hits[0].similarity - 0.9).abs() < 1e-4);
        assert_eq!((hits[1].rank, hits[1].person_id), (2, mid));
        assert!((hits[1].similarity - 0.7).abs() < 1e-4);
        assert_eq!(hits[1].access_level, 100);
    }

    #[test]
    fn test_search_empty_gallery() {
        let store = Store::open_in_memory().unwrap();
        let hits = search(&store, &Gallery::default(), &unit(0, 1.0), 5).unwrap();
        assert!(hits.is_empty());
    }
}
