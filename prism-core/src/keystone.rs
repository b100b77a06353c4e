//! Keystone (perspective) correction.
//!
//! Four corner positions in normalized screen coordinates define where the
//! unit video quad lands on screen. The 3x3 projective matrix mapping the
//! unit square onto that quad is recomputed on the host whenever a corner
//! moves and uploaded as a vertex-shader uniform; the GPU never sees the
//! corners themselves.

use serde::{Deserialize, Serialize};

use crate::config::{Corners, IDENTITY_CORNERS};

/// Each corner is confined to its own quadrant of the extended screen, which
/// keeps the quad convex (no edge can cross another).
const CORNER_RANGE: f32 = 0.5;
const CORNER_MARGIN: f32 = 1.0 / 32.0;

/// Legal range for corner `i`, as (min_x, max_x, min_y, max_y).
fn corner_bounds(i: usize) -> (f32, f32, f32, f32) {
    let lo = -CORNER_RANGE;
    let hi = 1.0 + CORNER_RANGE;
    let near = 0.5 - CORNER_MARGIN;
    let far = 0.5 + CORNER_MARGIN;
    match i {
        0 => (lo, near, lo, near), // top-left
        1 => (far, hi, lo, near),  // top-right
        2 => (far, hi, far, hi),   // bottom-right
        3 => (lo, near, far, hi),  // bottom-left
        _ => unreachable!("corner index out of range"),
    }
}

pub fn corner_in_range(i: usize, c: [f32; 2]) -> bool {
    let (min_x, max_x, min_y, max_y) = corner_bounds(i);
    c[0] >= min_x && c[0] <= max_x && c[1] >= min_y && c[1] <= max_y
}

fn clamp_corner(i: usize, c: [f32; 2]) -> [f32; 2] {
    let (min_x, max_x, min_y, max_y) = corner_bounds(i);
    [c[0].clamp(min_x, max_x), c[1].clamp(min_y, max_y)]
}

// ============================================================================
// 3x3 matrix
// ============================================================================

/// Row-major 3x3 matrix over f32.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mat3(pub [[f32; 3]; 3]);

impl Mat3 {
    pub const IDENTITY: Mat3 = Mat3([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);

    /// Affine scale + translate, for composing stream layout under keystone.
    pub fn scale_translate(sx: f32, sy: f32, tx: f32, ty: f32) -> Mat3 {
        Mat3([[sx, 0.0, tx], [0.0, sy, ty], [0.0, 0.0, 1.0]])
    }

    pub fn mul(&self, rhs: &Mat3) -> Mat3 {
        let mut out = [[0.0f32; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.0[r][k] * rhs.0[k][c]).sum();
            }
        }
        Mat3(out)
    }

    /// Apply to a 2-D point with projective divide.
    pub fn apply(&self, p: [f32; 2]) -> [f32; 2] {
        let m = &self.0;
        let x = m[0][0] * p[0] + m[0][1] * p[1] + m[0][2];
        let y = m[1][0] * p[0] + m[1][1] * p[1] + m[1][2];
        let w = m[2][0] * p[0] + m[2][1] * p[1] + m[2][2];
        [x / w, y / w]
    }

    /// Column-major flattening for `glUniformMatrix3fv` (transpose = false).
    pub fn to_gl(&self) -> [f32; 9] {
        let m = &self.0;
        [
            m[0][0], m[1][0], m[2][0], //
            m[0][1], m[1][1], m[2][1], //
            m[0][2], m[1][2], m[2][2],
        ]
    }

    pub fn approx_eq(&self, other: &Mat3, eps: f32) -> bool {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= eps)
    }
}

/// Projective map taking the unit square's corners, in order (0,0), (1,0),
/// (1,1), (0,1), onto the four given corners.
pub fn square_to_quad(c: &Corners) -> Mat3 {
    let [x0, y0] = [c[0][0], c[0][1]];
    let [x1, y1] = [c[1][0], c[1][1]];
    let [x2, y2] = [c[2][0], c[2][1]];
    let [x3, y3] = [c[3][0], c[3][1]];

    let sx = x0 - x1 + x2 - x3;
    let sy = y0 - y1 + y2 - y3;

    if sx.abs() < f32::EPSILON && sy.abs() < f32::EPSILON {
        // Parallelogram: plain affine map.
        return Mat3([
            [x1 - x0, x3 - x0, x0],
            [y1 - y0, y3 - y0, y0],
            [0.0, 0.0, 1.0],
        ]);
    }

    let dx1 = x1 - x2;
    let dx2 = x3 - x2;
    let dy1 = y1 - y2;
    let dy2 = y3 - y2;
    let den = dx1 * dy2 - dx2 * dy1;

    let g = (sx * dy2 - dx2 * sy) / den;
    let h = (dx1 * sy - sx * dy1) / den;

    Mat3([
        [x1 - x0 + g * x1, x3 - x0 + h * x3, x0],
        [y1 - y0 + g * y1, y3 - y0 + h * y3, y0],
        [g, h, 1.0],
    ])
}

// ============================================================================
// Mutable keystone state
// ============================================================================

/// Corner positions plus the cached matrix derived from them. Mutated only
/// between frames by input events; the render path reads the cache.
#[derive(Debug, Clone)]
pub struct KeystoneState {
    corners: Corners,
    initial: Corners,
    selected: usize,
    step: f32,
    matrix: Mat3,
}

impl KeystoneState {
    pub fn new(initial: Corners, step: f32) -> Self {
        let corners: Corners =
            std::array::from_fn(|i| clamp_corner(i, initial[i]));
        Self {
            corners,
            initial: corners,
            selected: 0,
            step,
            matrix: square_to_quad(&corners),
        }
    }

    pub fn corners(&self) -> &Corners {
        &self.corners
    }

    pub fn matrix(&self) -> &Mat3 {
        &self.matrix
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn select(&mut self, corner: usize) {
        if corner < 4 {
            self.selected = corner;
        }
    }

    /// Move the selected corner by whole steps. The corner is clamped so the
    /// quad stays non-degenerate.
    pub fn nudge(&mut self, dx: i32, dy: i32) {
        let i = self.selected;
        let moved = [
            self.corners[i][0] + dx as f32 * self.step,
            self.corners[i][1] + dy as f32 * self.step,
        ];
        self.corners[i] = clamp_corner(i, moved);
        self.matrix = square_to_quad(&self.corners);
    }

    pub fn reset(&mut self) {
        self.corners = self.initial;
        self.matrix = square_to_quad(&self.corners);
    }

    pub fn is_identity(&self) -> bool {
        self.matrix.approx_eq(&Mat3::IDENTITY, 1e-6)
    }
}

impl Default for KeystoneState {
    fn default() -> Self {
        Self::new(IDENTITY_CORNERS, 1.0 / 512.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

    #[test]
    fn identity_corners_give_identity_matrix() {
        let m = square_to_quad(&IDENTITY_CORNERS);
        assert!(m.approx_eq(&Mat3::IDENTITY, 1e-6));
        assert!(KeystoneState::default().is_identity());
    }

    #[test]
    fn corners_map_exactly() {
        let quad: Corners = [[0.1, 0.05], [0.9, 0.0], [1.0, 0.95], [0.0, 1.0]];
        let m = square_to_quad(&quad);
        for (src, want) in UNIT.iter().zip(quad.iter()) {
            let got = m.apply(*src);
            assert!(
                (got[0] - want[0]).abs() < 1e-5 && (got[1] - want[1]).abs() < 1e-5,
                "{src:?} -> {got:?}, want {want:?}"
            );
        }
    }

    #[test]
    fn affine_branch_for_parallelogram() {
        // Translated square: still a parallelogram, exercises the affine path.
        let quad: Corners = [[0.1, 0.1], [1.1, 0.1], [1.1, 1.1], [0.1, 1.1]];
        let m = square_to_quad(&quad);
        assert_eq!(m.0[2], [0.0, 0.0, 1.0]);
        for (src, want) in UNIT.iter().zip(quad.iter()) {
            let got = m.apply(*src);
            assert!((got[0] - want[0]).abs() < 1e-6 && (got[1] - want[1]).abs() < 1e-6);
        }
    }

    #[test]
    fn nudge_moves_only_the_selected_corner() {
        let mut ks = KeystoneState::new(IDENTITY_CORNERS, 0.01);
        ks.select(2);
        ks.nudge(-3, 2);
        assert_eq!(ks.corners()[0], IDENTITY_CORNERS[0]);
        assert_eq!(ks.corners()[1], IDENTITY_CORNERS[1]);
        assert_eq!(ks.corners()[3], IDENTITY_CORNERS[3]);
        let c2 = ks.corners()[2];
        assert!((c2[0] - 0.97).abs() < 1e-6);
        assert!((c2[1] - 1.02).abs() < 1e-6);
    }

    #[test]
    fn corners_cannot_cross() {
        let mut ks = KeystoneState::new(IDENTITY_CORNERS, 0.25);
        ks.select(0);
        for _ in 0..100 {
            ks.nudge(4, 4); // drive the top-left corner toward the center
        }
        let c0 = ks.corners()[0];
        assert!(c0[0] <= 0.5 - CORNER_MARGIN && c0[1] <= 0.5 - CORNER_MARGIN);
        // The quad is still strictly ordered left-right and top-bottom.
        let c = ks.corners();
        assert!(c[0][0] < c[1][0] && c[3][0] < c[2][0]);
        assert!(c[0][1] < c[3][1] && c[1][1] < c[2][1]);
    }

    #[test]
    fn reset_restores_initial_corners() {
        let initial: Corners = [[0.05, 0.0], [1.0, 0.1], [1.0, 1.0], [0.0, 1.0]];
        let mut ks = KeystoneState::new(initial, 0.01);
        ks.select(1);
        ks.nudge(5, 5);
        assert_ne!(ks.corners()[1], initial[1]);
        ks.reset();
        assert_eq!(ks.corners(), &initial);
    }

    #[test]
    fn layout_composes_under_keystone() {
        // Left half of the screen, keystone identity: the composed matrix is
        // exactly the layout transform.
        let layout = Mat3::scale_translate(0.5, 1.0, 0.0, 0.0);
        let composed = Mat3::IDENTITY.mul(&layout);
        assert!(composed.approx_eq(&layout, 1e-7));
        assert_eq!(composed.apply([1.0, 1.0]), [0.5, 1.0]);
    }

    #[test]
    fn gl_flattening_is_column_major() {
        let m = Mat3([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        assert_eq!(m.to_gl(), [1.0, 4.0, 7.0, 2.0, 5.0, 8.0, 3.0, 6.0, 9.0]);
    }
}
