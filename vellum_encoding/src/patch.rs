// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Instanced patch geometry.
//!
//! Once a contour has been tessellated into the tessellation texture, it is drawn as a
//! series of "patches": fixed instanced geometry spanning N tessellation segments. A patch
//! is made of an antialiasing border and fan triangles. The three patch types share a single
//! vertex buffer and a single index buffer, laid out back to back.

use std::sync::OnceLock;

use bytemuck::{Pod, Zeroable};

use crate::DrawType;

/// Number of tessellation segments spanned by a midpoint fan patch.
pub const MIDPOINT_FAN_PATCH_SEGMENT_SPAN: u32 = 8;

/// Number of tessellation segments spanned by an outer curve patch.
///
/// The final segment is a zero-length bowtie join without a fan triangle.
pub const OUTER_CURVE_PATCH_SEGMENT_SPAN: u32 = 17;

pub const MIDPOINT_FAN_PATCH_VERTEX_COUNT: u32 = MIDPOINT_FAN_PATCH_SEGMENT_SPAN * 4 // AA ramp
    + (MIDPOINT_FAN_PATCH_SEGMENT_SPAN + 1) // curve fan
    + 1; // triangle from the path midpoint
pub const MIDPOINT_FAN_PATCH_BORDER_INDEX_COUNT: u32 = MIDPOINT_FAN_PATCH_SEGMENT_SPAN * 6;
pub const MIDPOINT_FAN_PATCH_INDEX_COUNT: u32 = MIDPOINT_FAN_PATCH_BORDER_INDEX_COUNT
    + (MIDPOINT_FAN_PATCH_SEGMENT_SPAN - 1) * 3
    + 3;

pub const MIDPOINT_FAN_CENTER_AA_PATCH_VERTEX_COUNT: u32 = MIDPOINT_FAN_PATCH_SEGMENT_SPAN * 8
    + (MIDPOINT_FAN_PATCH_SEGMENT_SPAN + 1)
    + 1;
pub const MIDPOINT_FAN_CENTER_AA_PATCH_BORDER_INDEX_COUNT: u32 =
    MIDPOINT_FAN_PATCH_SEGMENT_SPAN * 12;
pub const MIDPOINT_FAN_CENTER_AA_PATCH_INDEX_COUNT: u32 =
    MIDPOINT_FAN_CENTER_AA_PATCH_BORDER_INDEX_COUNT + (MIDPOINT_FAN_PATCH_SEGMENT_SPAN - 1) * 3 + 3;

pub const OUTER_CURVE_PATCH_VERTEX_COUNT: u32 =
    OUTER_CURVE_PATCH_SEGMENT_SPAN * 8 + OUTER_CURVE_PATCH_SEGMENT_SPAN;
pub const OUTER_CURVE_PATCH_BORDER_INDEX_COUNT: u32 = OUTER_CURVE_PATCH_SEGMENT_SPAN * 12;
pub const OUTER_CURVE_PATCH_INDEX_COUNT: u32 =
    OUTER_CURVE_PATCH_BORDER_INDEX_COUNT + (OUTER_CURVE_PATCH_SEGMENT_SPAN - 2) * 3;

pub const MIDPOINT_FAN_PATCH_BASE_INDEX: u32 = 0;
pub const MIDPOINT_FAN_CENTER_AA_PATCH_BASE_INDEX: u32 = MIDPOINT_FAN_PATCH_INDEX_COUNT;
pub const OUTER_CURVE_PATCH_BASE_INDEX: u32 =
    MIDPOINT_FAN_CENTER_AA_PATCH_BASE_INDEX + MIDPOINT_FAN_CENTER_AA_PATCH_INDEX_COUNT;

pub const PATCH_VERTEX_BUFFER_COUNT: u32 = MIDPOINT_FAN_PATCH_VERTEX_COUNT
    + MIDPOINT_FAN_CENTER_AA_PATCH_VERTEX_COUNT
    + OUTER_CURVE_PATCH_VERTEX_COUNT;
pub const PATCH_INDEX_BUFFER_COUNT: u32 = MIDPOINT_FAN_PATCH_INDEX_COUNT
    + MIDPOINT_FAN_CENTER_AA_PATCH_INDEX_COUNT
    + OUTER_CURVE_PATCH_INDEX_COUNT;

// Index buffer offsets must be 4-byte aligned.
static_assertions::const_assert_eq!((MIDPOINT_FAN_CENTER_AA_PATCH_BASE_INDEX * 2) % 4, 0);
static_assertions::const_assert_eq!((OUTER_CURVE_PATCH_BASE_INDEX * 2) % 4, 0);

// Vertex roles, packed into the low bits of `PatchVertex::params`.
const STROKE_VERTEX: u32 = 0;
const FAN_VERTEX: u32 = 1;
const FAN_MIDPOINT_VERTEX: u32 = 2;

/// One vertex of the shared patch vertex buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct PatchVertex {
    /// Which of the two tessellated vertices being connected (0 or 1, plus the segment).
    pub local_vertex_id: f32,
    /// Outset from the tessellated position, along the normal.
    pub outset: f32,
    /// 0..1 for the stroke; 1 all around for the fan. Negated later for
    /// counterclockwise triangles.
    pub fill_coverage: f32,
    /// `(patch_segment_span << 2) | vertex_role`.
    pub params: f32,
    // Alternate position when the patch is mirrored, so the border diagonals line up on
    // both versions of the patch.
    pub mirrored_vertex_id: f32,
    pub mirrored_outset: f32,
    pub mirrored_fill_coverage: f32,
    pub padding: u32,
}

static_assertions::const_assert_eq!(size_of::<PatchVertex>(), 32);

impl PatchVertex {
    fn new(local_vertex_id: f32, outset: f32, fill_coverage: f32, params: f32) -> Self {
        Self {
            local_vertex_id,
            outset,
            fill_coverage,
            params,
            mirrored_vertex_id: local_vertex_id,
            mirrored_outset: outset,
            mirrored_fill_coverage: fill_coverage,
            padding: 0,
        }
    }

    fn mirrored(mut self, local_vertex_id: f32, outset: f32, fill_coverage: f32) -> Self {
        self.mirrored_vertex_id = local_vertex_id;
        self.mirrored_outset = outset;
        self.mirrored_fill_coverage = fill_coverage;
        self
    }
}

fn pack_params(patch_segment_span: u32, vertex_role: u32) -> f32 {
    ((patch_segment_span << 2) | vertex_role) as f32
}

/// Location of one patch type inside the shared patch buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchRange {
    pub segment_span: u32,
    pub base_index: u32,
    pub index_count: u32,
    pub border_index_count: u32,
}

impl PatchRange {
    pub const fn fan_index_count(&self) -> u32 {
        self.index_count - self.border_index_count
    }

    pub const fn fan_base_index(&self) -> u32 {
        self.base_index + self.border_index_count
    }
}

/// Returns where the patch geometry for `draw_type` lives, or `None` for non-patch draws.
pub const fn patch_range(draw_type: DrawType) -> Option<PatchRange> {
    match draw_type {
        DrawType::MidpointFanPatches => Some(PatchRange {
            segment_span: MIDPOINT_FAN_PATCH_SEGMENT_SPAN,
            base_index: MIDPOINT_FAN_PATCH_BASE_INDEX,
            index_count: MIDPOINT_FAN_PATCH_INDEX_COUNT,
            border_index_count: MIDPOINT_FAN_PATCH_BORDER_INDEX_COUNT,
        }),
        DrawType::MidpointFanCenterAAPatches => Some(PatchRange {
            segment_span: MIDPOINT_FAN_PATCH_SEGMENT_SPAN,
            base_index: MIDPOINT_FAN_CENTER_AA_PATCH_BASE_INDEX,
            index_count: MIDPOINT_FAN_CENTER_AA_PATCH_INDEX_COUNT,
            border_index_count: MIDPOINT_FAN_CENTER_AA_PATCH_BORDER_INDEX_COUNT,
        }),
        DrawType::OuterCurvePatches => Some(PatchRange {
            segment_span: OUTER_CURVE_PATCH_SEGMENT_SPAN,
            base_index: OUTER_CURVE_PATCH_BASE_INDEX,
            index_count: OUTER_CURVE_PATCH_INDEX_COUNT,
            border_index_count: OUTER_CURVE_PATCH_BORDER_INDEX_COUNT,
        }),
        _ => None,
    }
}

/// Number of indices drawn per instance of a patch, or 0 for non-patch draws.
pub const fn patch_index_count(draw_type: DrawType) -> u32 {
    match patch_range(draw_type) {
        Some(range) => range.index_count,
        None => 0,
    }
}

pub const fn patch_base_index(draw_type: DrawType) -> u32 {
    match patch_range(draw_type) {
        Some(range) => range.base_index,
        None => 0,
    }
}

/// Number of indices in the antialiasing border of a patch. Drawing only the border is
/// how strokes are rendered into the atlas.
pub const fn patch_border_index_count(draw_type: DrawType) -> u32 {
    match patch_range(draw_type) {
        Some(range) => range.border_index_count,
        None => 0,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PatchType {
    MidpointFan,
    MidpointFanCenterAA,
    OuterCurves,
}

/// Vertex and index data for every patch type.
#[derive(Debug)]
pub struct PatchBuffers {
    pub vertices: Vec<PatchVertex>,
    pub indices: Vec<u16>,
}

impl PatchBuffers {
    /// The process-wide patch geometry, generated on first use.
    pub fn get() -> &'static Self {
        static BUFFERS: OnceLock<PatchBuffers> = OnceLock::new();
        BUFFERS.get_or_init(Self::generate)
    }

    fn generate() -> Self {
        let mut buffers = Self {
            vertices: Vec::with_capacity(PATCH_VERTEX_BUFFER_COUNT as usize),
            indices: Vec::with_capacity(PATCH_INDEX_BUFFER_COUNT as usize),
        };
        buffers.push_patch(PatchType::MidpointFan);
        buffers.push_patch(PatchType::MidpointFanCenterAA);
        buffers.push_patch(PatchType::OuterCurves);
        debug_assert_eq!(buffers.vertices.len(), PATCH_VERTEX_BUFFER_COUNT as usize);
        debug_assert_eq!(buffers.indices.len(), PATCH_INDEX_BUFFER_COUNT as usize);
        buffers
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    fn push_patch(&mut self, patch_type: PatchType) {
        let base_vertex = self.vertices.len() as u16;
        let span = match patch_type {
            PatchType::OuterCurves => OUTER_CURVE_PATCH_SEGMENT_SPAN,
            _ => MIDPOINT_FAN_PATCH_SEGMENT_SPAN,
        };
        let v = &mut self.vertices;

        // Top (positive coverage) side of the AA border.
        let params = pack_params(span, STROKE_VERTEX);
        for i in 0..span {
            let l = i as f32;
            let r = l + 1.;
            let quad = match patch_type {
                PatchType::OuterCurves => [
                    PatchVertex::new(l, 0., 0.5, params).mirrored(r, 0., 0.5),
                    PatchVertex::new(l, 1., 0., params).mirrored(l, 0., 0.5),
                    PatchVertex::new(r, 0., 0.5, params).mirrored(r, 1., 0.),
                    PatchVertex::new(r, 1., 0., params).mirrored(l, 1., 0.),
                ],
                PatchType::MidpointFanCenterAA => [
                    PatchVertex::new(l, 0., 0.5, params).mirrored(r - 1., 0., 0.5),
                    PatchVertex::new(l, 1., 0., params).mirrored(l - 1., 0., 0.5),
                    PatchVertex::new(r, 0., 0.5, params).mirrored(r - 1., 1., 0.),
                    PatchVertex::new(r, 1., 0., params).mirrored(l - 1., 1., 0.),
                ],
                PatchType::MidpointFan => [
                    PatchVertex::new(l, -1., 1., params).mirrored(r - 1., -1., 1.),
                    PatchVertex::new(l, 1., 0., params).mirrored(l - 1., -1., 1.),
                    PatchVertex::new(r, -1., 1., params).mirrored(r - 1., 1., 0.),
                    PatchVertex::new(r, 1., 0., params).mirrored(l - 1., 1., 0.),
                ],
            };
            v.extend_from_slice(&quad);
        }

        // Bottom (negative coverage) side of the AA border.
        if patch_type != PatchType::MidpointFan {
            for i in 0..span {
                let l = i as f32;
                let r = l + 1.;
                // Mirrored positions of the center-AA patch are shifted one segment left.
                let m = if patch_type == PatchType::OuterCurves {
                    0.
                } else {
                    1.
                };
                v.extend_from_slice(&[
                    PatchVertex::new(l, -0., 0.5, params).mirrored(r - m, -0., 0.5),
                    PatchVertex::new(r, -0., 0.5, params).mirrored(r - m, -1., 0.),
                    PatchVertex::new(l, -1., 0., params).mirrored(l - m, -0., 0.5),
                    PatchVertex::new(r, -1., 0., params).mirrored(l - m, -1., 0.),
                ]);
            }
        }

        // Triangle fan vertices. On outer curves these only touch the first
        // `fan_segment_span` segments.
        let fan_vertices_idx = v.len() as u16 - base_vertex;
        let fan_segment_span = match patch_type {
            PatchType::OuterCurves => span - 1,
            _ => span,
        };
        debug_assert!(fan_segment_span.is_power_of_two());
        let params = pack_params(span, FAN_VERTEX);
        for i in 0..=fan_segment_span {
            let x = i as f32;
            v.push(match patch_type {
                PatchType::OuterCurves => PatchVertex::new(x, 0., 1., params),
                PatchType::MidpointFanCenterAA => {
                    PatchVertex::new(x, 0., 1., params).mirrored(x - 1., 0., 1.)
                }
                PatchType::MidpointFan => {
                    PatchVertex::new(x, -1., 1., params).mirrored(x - 1., -1., 1.)
                }
            });
        }

        // Outer curve patches have no midpoint vertex.
        let midpoint_idx = v.len() as u16 - base_vertex;
        if patch_type != PatchType::OuterCurves {
            v.push(PatchVertex::new(
                0.,
                0.,
                1.,
                pack_params(span, FAN_MIDPOINT_VERTEX),
            ));
        }

        const BORDER_PATTERN: [u16; 6] = [0, 1, 2, 2, 1, 3];
        const NEGATIVE_BORDER_PATTERN: [u16; 6] = [0, 2, 1, 1, 2, 3];
        let idx = &mut self.indices;
        let mut border_edge_vertices_idx = 0;
        for _ in 0..span {
            idx.extend(
                BORDER_PATTERN
                    .iter()
                    .map(|i| base_vertex + border_edge_vertices_idx + i),
            );
            border_edge_vertices_idx += 4;
        }
        if patch_type != PatchType::MidpointFan {
            for _ in 0..span {
                idx.extend(
                    NEGATIVE_BORDER_PATTERN
                        .iter()
                        .map(|i| base_vertex + border_edge_vertices_idx + i),
                );
                border_edge_vertices_idx += 4;
            }
        }
        debug_assert_eq!(border_edge_vertices_idx, fan_vertices_idx);

        // Fan indices, in a middle-out topology. The bowtie join on outer curves gets no
        // fan triangle.
        let fan = base_vertex + fan_vertices_idx;
        let fan_segment_span = fan_segment_span as u16;
        let mut step = 1;
        while step < fan_segment_span {
            for i in (0..fan_segment_span).step_by(usize::from(step) * 2) {
                idx.extend_from_slice(&[fan + i, fan + i + step, fan + i + step * 2]);
            }
            step <<= 1;
        }
        if patch_type != PatchType::OuterCurves {
            // Triangle to the contour midpoint.
            idx.extend_from_slice(&[fan, fan + fan_segment_span, base_vertex + midpoint_idx]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_match_constants() {
        assert_eq!(MIDPOINT_FAN_PATCH_VERTEX_COUNT, 42);
        assert_eq!(MIDPOINT_FAN_PATCH_INDEX_COUNT, 72);
        assert_eq!(MIDPOINT_FAN_CENTER_AA_PATCH_VERTEX_COUNT, 74);
        assert_eq!(MIDPOINT_FAN_CENTER_AA_PATCH_INDEX_COUNT, 120);
        assert_eq!(OUTER_CURVE_PATCH_VERTEX_COUNT, 153);
        assert_eq!(OUTER_CURVE_PATCH_INDEX_COUNT, 249);

        let buffers = PatchBuffers::get();
        assert_eq!(buffers.vertices.len(), PATCH_VERTEX_BUFFER_COUNT as usize);
        assert_eq!(buffers.indices.len(), PATCH_INDEX_BUFFER_COUNT as usize);
        assert_eq!(buffers.vertex_bytes().len(), buffers.vertices.len() * 32);
    }

    #[test]
    fn indices_stay_within_their_patch() {
        let buffers = PatchBuffers::get();
        let vertex_ranges = [
            0..MIDPOINT_FAN_PATCH_VERTEX_COUNT,
            MIDPOINT_FAN_PATCH_VERTEX_COUNT
                ..MIDPOINT_FAN_PATCH_VERTEX_COUNT + MIDPOINT_FAN_CENTER_AA_PATCH_VERTEX_COUNT,
            MIDPOINT_FAN_PATCH_VERTEX_COUNT + MIDPOINT_FAN_CENTER_AA_PATCH_VERTEX_COUNT
                ..PATCH_VERTEX_BUFFER_COUNT,
        ];
        let draw_types = [
            DrawType::MidpointFanPatches,
            DrawType::MidpointFanCenterAAPatches,
            DrawType::OuterCurvePatches,
        ];
        for (draw_type, vertices) in draw_types.into_iter().zip(vertex_ranges) {
            let range = patch_range(draw_type).unwrap();
            let start = range.base_index as usize;
            let end = start + range.index_count as usize;
            for &index in &buffers.indices[start..end] {
                assert!(
                    vertices.contains(&u32::from(index)),
                    "{draw_type:?} index {index} outside {vertices:?}"
                );
            }
        }
    }

    #[test]
    fn fan_follows_border() {
        let range = patch_range(DrawType::MidpointFanPatches).unwrap();
        assert_eq!(range.fan_index_count(), 24);
        assert_eq!(range.fan_base_index(), 48);
        assert!(patch_range(DrawType::ImageRect).is_none());

        // The last midpoint fan triangle reaches the midpoint vertex.
        let buffers = PatchBuffers::get();
        let last = (range.base_index + range.index_count) as usize - 1;
        assert_eq!(
            u32::from(buffers.indices[last]),
            MIDPOINT_FAN_PATCH_VERTEX_COUNT - 1
        );
        let midpoint = buffers.vertices[(MIDPOINT_FAN_PATCH_VERTEX_COUNT - 1) as usize];
        assert_eq!(midpoint.params, ((8 << 2) | FAN_MIDPOINT_VERTEX) as f32);
    }
}
