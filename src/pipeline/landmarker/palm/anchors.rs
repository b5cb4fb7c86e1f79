use std::sync::OnceLock;

use super::super::common::PALM_INPUT_SIZE;

/// Feature-map strides of the palm detector and the number of anchors per cell. Layers sharing a
/// stride are merged into one grid, as the SSD anchor calculator does.
const LAYERS: &[(u32, usize)] = &[(8, 2), (16, 6)];

pub const NUM_ANCHORS: usize = 2016;

/// Anchor centres in normalized input coordinates. Anchor sizes are fixed at 1.
pub fn anchors() -> &'static [[f32; 2]] {
    static ANCHORS: OnceLock<Vec<[f32; 2]>> = OnceLock::new();
    ANCHORS.get_or_init(generate)
}

fn generate() -> Vec<[f32; 2]> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    for &(stride, per_cell) in LAYERS {
        let grid = PALM_INPUT_SIZE.div_ceil(stride);
        for y in 0..grid {
            for x in 0..grid {
                let center = [
                    (x as f32 + 0.5) / grid as f32,
                    (y as f32 + 0.5) / grid as f32,
                ];
                anchors.extend(std::iter::repeat_n(center, per_cell));
            }
        }
    }
    anchors
}
