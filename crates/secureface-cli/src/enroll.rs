//! Enrollment from image files, through the same stages the daemon runs.

use crate::faces::FaceEmbedding;
use anyhow::{bail, Result};
use secureface_store::Store;
use std::path::{Path, PathBuf};

pub struct EnrollSummary {
    pub reference_count: usize,
    /// Confidence of the chosen face; `None` for pre-aligned input.
    pub detection_confidence: Option<f32>,
}

/// Store `face` as a reference for an existing user and record its source image.
pub fn enroll_face(
    store: &Store,
    user_id: i64,
    face: &FaceEmbedding,
    image_path: Option<&Path>,
) -> Result<EnrollSummary> {
    store.add_embedding(user_id, &face.embedding)?;

    if let Some(path) = image_path {
        let mut user = store.get_user(user_id)?;
        user.image_path = Some(path.to_string_lossy().into_owned());
        store.update_user(&user)?;
    }

    Ok(EnrollSummary {
        reference_count: store.count_embeddings(user_id)?,
        detection_confidence: face.detection_confidence,
    })
}

#[derive(Default)]
pub struct BatchSummary {
    /// New user id and the image it was enrolled from.
    pub enrolled: Vec<(i64, PathBuf)>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Enroll each image as a new user named after its file stem.
///
/// Images whose face cannot be embedded are reported and skipped; no user is
/// created for them. Stops after `limit` successful enrollments.
pub fn enroll_batch<F>(
    store: &Store,
    files: &[PathBuf],
    role_id: i64,
    department: Option<&str>,
    limit: Option<usize>,
    mut embed: F,
) -> Result<BatchSummary>
where
    F: FnMut(&Path) -> Result<FaceEmbedding>,
{
    let mut summary = BatchSummary::default();
    for path in files {
        if limit.is_some_and(|n| summary.enrolled.len() >= n) {
            break;
        }
        let Some(name) = name_from_file(path) else {
            summary.failed.push((path.clone(), "no usable name in file name".into()));
            continue;
        };
        let face = match embed(path) {
            Ok(face) => face,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping image");
                summary.failed.push((path.clone(), format!("{e:#}")));
                continue;
            }
        };

        let user = store.create_user(&name, role_id, department)?;
        enroll_face(store, user.id, &face, Some(path))?;
        summary.enrolled.push((user.id, path.clone()));
    }

    if summary.enrolled.is_empty() && !summary.failed.is_empty() {
        bail!("no image in the batch could be enrolled");
    }
    Ok(summary)
}

/// `jane_doe.jpg` → `jane doe`.
fn name_from_file(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem
        .split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::embed_image;
    use crate::faces::testing::{face, Fixed, Recorder};
    use image::RgbImage;
    use secureface_core::PipelineParams;

    fn user(store: &Store) -> i64 {
        let role = store.role_by_name("Employee").unwrap();
        store.create_user("Lin", role.role.id, None).unwrap().id
    }

    #[test]
    fn test_enroll_uses_most_confident_face() {
        let store = Store::open_in_memory().unwrap();
        let id = user(&store);
        let mut detector = Fixed(vec![face(20.0, 0.7, 0.0), face(300.0, 0.95, 0.0)]);
        let mut embedder = Recorder::default();

        let embedded = embed_image(
            RgbImage::new(480, 200),
            &PipelineParams::default(),
            Some(&mut detector),
            &mut embedder,
        )
        .unwrap();
        let summary = enroll_face(&store, id, &embedded, Some(Path::new("/srv/faces/lin.png"))).unwrap();

        assert_eq!(summary.reference_count, 1);
        assert!((summary.detection_confidence.unwrap() - 0.95).abs() < 1e-6);
        assert_eq!(embedder.seen[0].image.dimensions(), (112, 112));
        assert_eq!(store.get_user(id).unwrap().image_path.as_deref(), Some("/srv/faces/lin.png"));
        assert_eq!(store.load_gallery().unwrap().len(), 1);
    }

    #[test]
    fn test_enroll_aligned_skips_detection() {
        let store = Store::open_in_memory().unwrap();
        let id = user(&store);
        let mut embedder = Recorder::default();

        let embedded = embed_image(RgbImage::new(96, 96), &PipelineParams::default(), None, &mut embedder).unwrap();
        let summary = enroll_face(&store, id, &embedded, None).unwrap();
        assert!(summary.detection_confidence.is_none());
        assert_eq!(embedder.seen[0].image.dimensions(), (112, 112));
        assert!(store.get_user(id).unwrap().image_path.is_none());
    }

    #[test]
    fn test_name_from_file() {
        assert_eq!(name_from_file(Path::new("/in/jane_doe.jpg")).as_deref(), Some("jane doe"));
        assert_eq!(name_from_file(Path::new("ana-maria lee.png")).as_deref(), Some("ana maria lee"));
        assert_eq!(name_from_file(Path::new("__.png")), None);
    }

    #[test]
    fn test_batch_skips_failures_and_honours_limit() {
        let store = Store::open_in_memory().unwrap();
        let role = store.role_by_name("Security").unwrap().role.id;
        let files: Vec<PathBuf> = ["a_one.png", "b_noface.png", "c_three.png", "d_four.png"]
            .iter()
            .map(PathBuf::from)
            .collect();

        let mut embedder = Recorder::default();
        let summary = enroll_batch(&store, &files, role, Some("Ops"), Some(2), |path| {
            let boxes = if path.ends_with("b_noface.png") { vec![] } else { vec![face(20.0, 0.9, 0.0)] };
            embed_image(
                RgbImage::new(200, 200),
                &PipelineParams::default(),
                Some(&mut Fixed(boxes)),
                &mut embedder,
            )
        })
        .unwrap();

        assert_eq!(summary.enrolled.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].0.ends_with("b_noface.png"));

        let users = store.list_users().unwrap();
        let names: Vec<&str> = users.iter().map(|u| u.full_name.as_str()).collect();
        assert_eq!(names, vec!["a one", "c three"]);
        assert!(users.iter().all(|u| u.role_id == role && u.department.as_deref() == Some("Ops")));
        assert_eq!(store.load_gallery().unwrap().reference_count(), 2);
    }

    #[test]
    fn test_batch_with_nothing_enrolled_fails() {
        let store = Store::open_in_memory().unwrap();
        let role = store.role_by_name("Employee").unwrap().role.id;
        let files = vec![PathBuf::from("x.png")];
        let result = enroll_batch(&store, &files, role, None, None, |_| Err(anyhow::anyhow!("unreadable")));
        assert!(result.is_err());
        assert!(store.list_users().unwrap().is_empty());
    }
}
