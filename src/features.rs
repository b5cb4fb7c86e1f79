//! Pairwise-distance features for hand landmarks.
//!
//! A hand's feature vector is the strict upper triangle of its 21×21 Euclidean distance
//! matrix, read row by row. Downstream classifiers are trained on exactly this layout, so the
//! ordering must never change. Distances are computed in `f64` and narrowed to `f32` once, when
//! the triangle is flattened.

use ndarray::Array2;

use crate::types::{HandObservation, Landmark, NUM_LANDMARKS};

/// Length of one hand's feature vector: 21 · 20 / 2.
pub const FEATURES_PER_HAND: usize = NUM_LANDMARKS * (NUM_LANDMARKS - 1) / 2;

pub fn distance_matrix(landmarks: &[Landmark; NUM_LANDMARKS]) -> Array2<f64> {
    let mut matrix = Array2::<f64>::zeros((NUM_LANDMARKS, NUM_LANDMARKS));
    for i in 0..NUM_LANDMARKS {
        for j in (i + 1)..NUM_LANDMARKS {
            let distance = euclidean(&landmarks[i], &landmarks[j]);
            matrix[[i, j]] = distance;
            matrix[[j, i]] = distance;
        }
    }
    matrix
}

/// Flattens the strict upper triangle (`i < j`) of a square matrix in row-major order.
pub fn upper_triangle_flatten(matrix: &Array2<f64>) -> Vec<f32> {
    let n = matrix.nrows().min(matrix.ncols());
    let mut features = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for (i, row) in matrix.outer_iter().enumerate().take(n) {
        features.extend(row.iter().take(n).skip(i + 1).map(|&d| d as f32));
    }
    features
}

pub fn extract_one(hand: &HandObservation) -> Vec<f32> {
    upper_triangle_flatten(&distance_matrix(&hand.landmarks))
}

/// Concatenates per-hand vectors in detection order. Hands are never re-sorted by handedness.
pub fn extract_combined(hands: &[HandObservation]) -> Vec<f32> {
    let mut features = Vec::with_capacity(FEATURES_PER_HAND * hands.len());
    for hand in hands {
        features.extend(extract_one(hand));
    }
    features
}

fn euclidean(a: &Landmark, b: &Landmark) -> f64 {
    let dx = a.x as f64 - b.x as f64;
    let dy = a.y as f64 - b.y as f64;
    let dz = a.z as f64 - b.z as f64;
    (dx * dx + dy * dy + dz * dz).sqrt()
}
