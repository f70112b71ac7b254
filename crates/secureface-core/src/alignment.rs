//! Face alignment via 4-DOF similarity transform, plus the pass-through and
//! full-frame crops and the final channel/size normalization.
//!
//! Aligns detected faces to a canonical 112×112 position using the five
//! InsightFace reference landmarks and least-squares estimation.

use crate::types::{AlignedFace, AlignmentKind, ChannelOrder, DetectedFace, FaceOrigin, Frame};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use thiserror::Error;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Minimum inter-ocular distance (pixels) for landmarks to be usable.
const MIN_EYE_DISTANCE: f32 = 2.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("face has no landmarks; the detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("degenerate landmarks: {0}")]
    DegenerateLandmarks(String),
    #[error("empty crop region")]
    EmptyRegion,
}

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
/// or `None` when the normal equations are singular.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<[f32; 6]> {
    // Build overdetermined system A * [a, b, tx, ty]^T = B
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16]; // 4x4, row-major
    let mut atb = [0.0f32; 4]; // 4x1

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb)?;
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    Some([a, -b, tx, b, a, ty])
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> Option<[f32; 4]> {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 || !pivot.is_finite() {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Apply a 2×3 similarity warp to produce a square 3-channel output.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with 0 (black).
fn warp_affine(src: &RgbImage, matrix: &[f32; 6], out_size: u32) -> Option<RgbImage> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    // Invert the 2x2 part: M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    let ia = a * inv_det;
    let ib = b * inv_det;

    let (src_w, src_h) = (src.width() as i32, src.height() as i32);
    let sample = |x: i32, y: i32, c: usize| -> f32 {
        if x >= 0 && x < src_w && y >= 0 && y < src_h {
            src.get_pixel(x as u32, y as u32).0[c] as f32
        } else {
            0.0
        }
    };

    let mut output = RgbImage::new(out_size, out_size);
    for (ox, oy, px) in output.enumerate_pixels_mut() {
        // Map output pixel back to source: src = M_inv * (dst - t)
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut rgb = [0u8; 3];
        for (c, out) in rgb.iter_mut().enumerate() {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *out = val.round().clamp(0.0, 255.0) as u8;
        }
        *px = Rgb(rgb);
    }

    Some(output)
}

fn check_landmarks(landmarks: &[(f32, f32); 5]) -> Result<(), AlignmentError> {
    if landmarks.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(AlignmentError::DegenerateLandmarks("non-finite coordinate".into()));
    }
    let (lx, ly) = landmarks[0];
    let (rx, ry) = landmarks[1];
    let eye_dist = ((rx - lx).powi(2) + (ry - ly).powi(2)).sqrt();
    if eye_dist < MIN_EYE_DISTANCE {
        return Err(AlignmentError::DegenerateLandmarks(format!(
            "eyes {eye_dist:.2}px apart"
        )));
    }
    Ok(())
}

/// Align landmarks in `image` coordinates to a canonical 112×112 crop.
///
/// Takes a 3-channel image and five facial landmarks, computes the
/// similarity transform to reference positions, and warps the face region
/// into a 112×112 aligned output suitable for ArcFace embedding extraction.
pub fn align_face(
    image: &RgbImage,
    landmarks: &[(f32, f32); 5],
) -> Result<(RgbImage, [f32; 6]), AlignmentError> {
    check_landmarks(landmarks)?;
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112)
        .ok_or_else(|| AlignmentError::DegenerateLandmarks("singular transform".into()))?;
    let aligned = warp_affine(image, &matrix, ALIGNED_SIZE)
        .ok_or_else(|| AlignmentError::DegenerateLandmarks("zero-scale transform".into()))?;
    Ok((aligned, matrix))
}

/// Normal mode: crop the margin-expanded region and align by landmarks.
///
/// Pixels outside the expanded region do not contribute to the aligned face.
pub fn align_detected(frame: &Frame, face: &DetectedFace) -> Result<AlignedFace, AlignmentError> {
    let landmarks = face.detection.landmarks.ok_or(AlignmentError::NoLandmarks)?;
    let crop = crop_region(frame, face)?;

    let (ox, oy) = (face.region.x as f32, face.region.y as f32);
    let local = landmarks.map(|(x, y)| (x - ox, y - oy));

    let (image, matrix) = align_face(&crop, &local)?;
    Ok(AlignedFace {
        image,
        order: frame.order,
        origin: FaceOrigin::Detected(face.index),
        kind: AlignmentKind::Similarity(matrix),
    })
}

/// The margin-expanded region of a detection, as its own image.
pub fn crop_region(frame: &Frame, face: &DetectedFace) -> Result<RgbImage, AlignmentError> {
    let r = face.region;
    if r.width == 0
        || r.height == 0
        || r.x.saturating_add(r.width) > frame.width()
        || r.y.saturating_add(r.height) > frame.height()
    {
        return Err(AlignmentError::EmptyRegion);
    }
    Ok(imageops::crop_imm(&frame.image, r.x, r.y, r.width, r.height).to_image())
}

/// AlignedFace mode: the frame is taken to already hold one aligned face.
pub fn pass_through(frame: &Frame) -> Result<AlignedFace, AlignmentError> {
    whole_frame(frame, AlignmentKind::PassThrough)
}

/// FullFrame mode: forward the whole frame as the unit to embed.
pub fn full_frame(frame: &Frame) -> Result<AlignedFace, AlignmentError> {
    whole_frame(frame, AlignmentKind::FullFrame)
}

fn whole_frame(frame: &Frame, kind: AlignmentKind) -> Result<AlignedFace, AlignmentError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(AlignmentError::EmptyRegion);
    }
    Ok(AlignedFace {
        image: frame.image.clone(),
        order: frame.order,
        origin: FaceOrigin::WholeFrame,
        kind,
    })
}

/// Swap R and B in place.
pub fn swap_red_blue(image: &mut RgbImage) {
    for px in image.pixels_mut() {
        px.0.swap(0, 2);
    }
}

/// Uniform last step before embedding in every mode: optional BGR→RGB
/// reordering and resize to `target_size`.
pub fn finalize(mut face: AlignedFace, convert_to_rgb: bool, target_size: (u32, u32)) -> AlignedFace {
    if convert_to_rgb && face.order == ChannelOrder::Bgr {
        swap_red_blue(&mut face.image);
        face.order = ChannelOrder::Rgb;
    }
    let (w, h) = target_size;
    if face.image.dimensions() != (w, h) {
        face.image = imageops::resize(&face.image, w, h, FilterType::Triangle);
    }
    face
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, CropRegion};
    use chrono::Utc;

    fn frame_from(image: RgbImage, order: ChannelOrder) -> Frame {
        Frame {
            image,
            order,
            camera_id: 1,
            sequence: 0,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_identity_transform() {
        // When src == dst, transform should be identity-like (a≈1, b≈0)
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts).unwrap();

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let src: [(f32, f32); 5] = [
            (76.5892, 103.3926),
            (147.0636, 103.0028),
            (112.0504, 143.4732),
            (83.0986, 184.7310),
            (141.4598, 184.4082),
        ];
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_collapsed_landmarks_rejected() {
        let pts = [(50.0f32, 50.0f32); 5];
        let img = RgbImage::new(100, 100);
        let err = align_face(&img, &pts).unwrap_err();
        assert!(matches!(err, AlignmentError::DegenerateLandmarks(_)));
    }

    #[test]
    fn test_nan_landmarks_rejected() {
        let mut pts = REFERENCE_LANDMARKS_112;
        pts[2] = (f32::NAN, 3.0);
        let img = RgbImage::new(112, 112);
        assert!(matches!(
            align_face(&img, &pts),
            Err(AlignmentError::DegenerateLandmarks(_))
        ));
    }

    #[test]
    fn test_align_face_output_size() {
        let img = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let (aligned, _) = align_face(&img, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // Place a bright patch at a landmark position, verify it lands near the
        // reference position after alignment.
        let mut img = RgbImage::new(200, 200);
        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for dy in 0..5u32 {
            for dx in 0..5u32 {
                img.put_pixel(78 + dx, 58 + dy, Rgb([255, 255, 255]));
            }
        }

        let (aligned, _) = align_face(&img, &src_landmarks).unwrap();

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as u32;
        let mut max_val = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                max_val = max_val.max(aligned.get_pixel(x, y).0[0]);
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }

    #[test]
    fn test_align_detected_requires_landmarks() {
        let frame = frame_from(RgbImage::new(100, 100), ChannelOrder::Bgr);
        let face = DetectedFace {
            index: 0,
            detection: BoundingBox {
                x: 10.0, y: 10.0, width: 50.0, height: 50.0,
                confidence: 0.9, landmarks: None,
            },
            region: CropRegion { x: 0, y: 0, width: 80, height: 80 },
            frame_sequence: 0,
        };
        assert_eq!(align_detected(&frame, &face).unwrap_err(), AlignmentError::NoLandmarks);
    }

    #[test]
    fn test_align_detected_uses_region_offset() {
        let mut img = RgbImage::new(300, 300);
        // Same face as test_landmark_roundtrip, shifted by (100, 100)
        for dy in 0..5u32 {
            for dx in 0..5u32 {
                img.put_pixel(178 + dx, 158 + dy, Rgb([255, 0, 0]));
            }
        }
        let landmarks = [
            (180.0, 160.0),
            (220.0, 160.0),
            (200.0, 185.0),
            (185.0, 210.0),
            (215.0, 210.0),
        ];
        let frame = frame_from(img, ChannelOrder::Rgb);
        let face = DetectedFace {
            index: 3,
            detection: BoundingBox {
                x: 170.0, y: 150.0, width: 60.0, height: 70.0,
                confidence: 0.9, landmarks: Some(landmarks),
            },
            region: CropRegion { x: 140, y: 120, width: 120, height: 130 },
            frame_sequence: 0,
        };
        let aligned = align_detected(&frame, &face).unwrap();
        assert_eq!(aligned.origin, FaceOrigin::Detected(3));
        let (x, y) = (38u32, 52u32);
        let hot = (y - 1..=y + 1)
            .flat_map(|yy| (x - 1..=x + 1).map(move |xx| (xx, yy)))
            .map(|(xx, yy)| aligned.image.get_pixel(xx, yy).0[0])
            .max()
            .unwrap();
        assert!(hot > 100);
    }

    #[test]
    fn test_crop_region_out_of_bounds() {
        let frame = frame_from(RgbImage::new(50, 50), ChannelOrder::Rgb);
        let face = DetectedFace {
            index: 0,
            detection: BoundingBox {
                x: 0.0, y: 0.0, width: 10.0, height: 10.0,
                confidence: 0.9, landmarks: None,
            },
            region: CropRegion { x: 45, y: 0, width: 10, height: 10 },
            frame_sequence: 0,
        };
        assert_eq!(crop_region(&frame, &face).unwrap_err(), AlignmentError::EmptyRegion);
    }

    #[test]
    fn test_finalize_swaps_and_resizes() {
        let img = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
        let frame = frame_from(img, ChannelOrder::Bgr);
        let face = finalize(pass_through(&frame).unwrap(), true, (112, 112));
        assert_eq!(face.order, ChannelOrder::Rgb);
        assert_eq!(face.image.dimensions(), (112, 112));
        assert_eq!(face.image.get_pixel(50, 50).0, [30, 20, 10]);
        assert_eq!(face.kind, AlignmentKind::PassThrough);
    }

    #[test]
    fn test_finalize_without_conversion_keeps_order() {
        let img = RgbImage::from_pixel(112, 112, Rgb([10, 20, 30]));
        let frame = frame_from(img, ChannelOrder::Bgr);
        let face = finalize(full_frame(&frame).unwrap(), false, (112, 112));
        assert_eq!(face.order, ChannelOrder::Bgr);
        assert_eq!(face.image.get_pixel(0, 0).0, [10, 20, 30]);
        assert_eq!(face.kind, AlignmentKind::FullFrame);
        assert_eq!(face.origin, FaceOrigin::WholeFrame);
    }
}
