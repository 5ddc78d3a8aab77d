// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Records shared with the GPU, and the constants that size the flush textures.
//!
//! This must be kept in sync with the structs the shaders declare.

use bytemuck::{Pod, Zeroable};

use crate::FlushDescriptor;

/// All transient GPU buffers are allocated in rings of this many slots, so the CPU can
/// prepare a frame while the GPU renders the previous ones.
pub const BUFFER_RING_SIZE: usize = 3;

/// Width of the gradient texture, in texels.
pub const GRAD_TEXTURE_WIDTH: u32 = 512;
pub const GRAD_TEXTURE_WIDTH_IN_SIMPLE_RAMPS: u32 = GRAD_TEXTURE_WIDTH / 2;

/// Width of the tessellation data texture, in texels.
pub const TESS_TEXTURE_WIDTH: u32 = 2048;
pub const TESS_TEXTURE_WIDTH_LOG2: u32 = 11;
static_assertions::const_assert_eq!(1 << TESS_TEXTURE_WIDTH_LOG2, TESS_TEXTURE_WIDTH);

/// Upper bound on either dimension of the coverage atlas.
pub const MAX_ATLAS_SIZE: u32 = 4096;

/// Gradient spans are drawn as instanced 4-vertex triangle strips.
pub const GRAD_SPAN_TRI_STRIP_VERTEX_COUNT: u32 = 4;

/// Vertex buffers bound at an offset must be aligned to 256 bytes on some APIs.
pub const VERTEX_BUFFER_ALIGNMENT: u32 = 256;

/// One horizontal color ramp span of the gradient texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct GradientSpan {
    /// `x1 << 16 | x0`, both normalized texel coordinates in fixed point `0..=65535`.
    pub horizontal_span: u32,
    pub y: u32,
    pub color0: u32,
    pub color1: u32,
}

static_assertions::const_assert_eq!(size_of::<GradientSpan>(), 16);
static_assertions::const_assert_eq!(256 % size_of::<GradientSpan>(), 0);

impl GradientSpan {
    pub fn new(x0_fixed: u32, x1_fixed: u32, y: u32, color0: u32, color1: u32) -> Self {
        debug_assert!(x0_fixed < 65536);
        debug_assert!(x1_fixed < 65536);
        Self {
            horizontal_span: (x1_fixed << 16) | x0_fixed,
            y,
            color0,
            color1,
        }
    }
}

/// One instance of a horizontal span of tessellated vertices.
///
/// Each span has an optional reflection, rendered right to left, which emits the same
/// vertices in reverse order for mirrored patches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct TessVertexSpan {
    /// Cubic bezier control points.
    pub pts: [[f32; 2]; 4],
    /// Ending tangent of the join that follows the cubic.
    pub join_tangent: [f32; 2],
    pub y: f32,
    pub reflection_y: f32,
    pub x0x1: i32,
    pub reflection_x0x1: i32,
    /// `join << 20 | polar << 10 | parametric`.
    pub segment_counts: u32,
    pub contour_id_with_flags: u32,
}

static_assertions::const_assert_eq!(size_of::<TessVertexSpan>(), 64);
static_assertions::const_assert_eq!(256 % size_of::<TessVertexSpan>(), 0);

/// Segment counts of one tessellated curve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentCounts {
    pub parametric: u32,
    pub polar: u32,
    pub join: u32,
}

impl TessVertexSpan {
    /// A span without a reflection.
    pub fn new(
        pts: [[f32; 2]; 4],
        join_tangent: [f32; 2],
        y: f32,
        x0: i32,
        x1: i32,
        counts: SegmentCounts,
        contour_id_with_flags: u32,
    ) -> Self {
        // A NaN reflection row gets discarded by the rasterizer.
        Self::with_reflection(
            pts,
            join_tangent,
            [y, f32::NAN],
            [x0, x1, -1, -1],
            counts,
            contour_id_with_flags,
        )
    }

    /// A span and its mirrored reflection: `rows` is `[y, reflection_y]` and `xs` is
    /// `[x0, x1, reflection_x0, reflection_x1]`.
    pub fn with_reflection(
        pts: [[f32; 2]; 4],
        join_tangent: [f32; 2],
        rows: [f32; 2],
        xs: [i32; 4],
        counts: SegmentCounts,
        contour_id_with_flags: u32,
    ) -> Self {
        debug_assert!(counts.parametric < 1 << 10);
        debug_assert!(counts.polar < 1 << 10);
        debug_assert!(counts.join < 1 << 12);
        let [x0, x1, rx0, rx1] = xs;
        Self {
            pts,
            join_tangent,
            y: rows[0],
            reflection_y: rows[1],
            x0x1: (x1 << 16) | (x0 & 0xffff),
            reflection_x0x1: (rx1 << 16) | (rx0 & 0xffff),
            segment_counts: (counts.join << 20) | (counts.polar << 10) | counts.parametric,
            contour_id_with_flags,
        }
    }

    pub fn x0(&self) -> i32 {
        (self.x0x1 << 16) >> 16
    }

    pub fn x1(&self) -> i32 {
        self.x0x1 >> 16
    }

    pub fn segment_counts(&self) -> SegmentCounts {
        SegmentCounts {
            parametric: self.segment_counts & 0x3ff,
            polar: (self.segment_counts >> 10) & 0x3ff,
            join: self.segment_counts >> 20,
        }
    }
}

/// Tessellation spans are drawn as two 1px-tall rectangles: the span and its reflection.
pub const TESS_SPAN_INDICES: [u16; 12] = [0, 1, 2, 2, 1, 3, 4, 5, 6, 6, 5, 7];

/// Vertex of the antialiased image rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct ImageRectVertex {
    pub x: f32,
    pub y: f32,
    pub aa_offset_x: f32,
    pub aa_offset_y: f32,
}

const fn rect_vertex(x: f32, y: f32, aa_offset_x: f32, aa_offset_y: f32) -> ImageRectVertex {
    ImageRectVertex {
        x,
        y,
        aa_offset_x,
        aa_offset_y,
    }
}

pub const IMAGE_RECT_VERTICES: [ImageRectVertex; 12] = [
    rect_vertex(0., 0., 0., -1.),
    rect_vertex(1., 0., 0., -1.),
    rect_vertex(1., 0., 1., 0.),
    rect_vertex(1., 1., 1., 0.),
    rect_vertex(1., 1., 0., 1.),
    rect_vertex(0., 1., 0., 1.),
    rect_vertex(0., 1., -1., 0.),
    rect_vertex(0., 0., -1., 0.),
    rect_vertex(0., 0., 1., 1.),
    rect_vertex(1., 0., -1., 1.),
    rect_vertex(1., 1., -1., -1.),
    rect_vertex(0., 1., 1., -1.),
];

pub const IMAGE_RECT_INDICES: [u16; 42] = [
    8, 0, 9, 9, 0, 1, 1, 2, 9, 9, 2, 10, 10, 2, 3, 3, 4, 10, 10, 4, 11, 11, 4, 5, 5, 6, 11, 11,
    6, 8, 8, 6, 7, 7, 0, 8, 9, 10, 8, 10, 8, 11,
];

/// Per-flush uniform block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct FlushUniforms {
    pub inverse_viewport: [f32; 2],
    pub render_target_width: u32,
    pub render_target_height: u32,
    /// Premultiplied RGBA8, red in the low byte.
    pub color_clear_value: u32,
    pub coverage_clear_value: u32,
    /// `[left, top, right, bottom]`.
    pub render_target_update_bounds: [i32; 4],
    pub atlas_texture_inverse_size: [f32; 2],
    pub grad_inverse_viewport_y: f32,
    pub tess_inverse_viewport_y: f32,
    pub path_id_granularity: u32,
    pub vertex_discard_value: f32,
}

static_assertions::const_assert_eq!(size_of::<FlushUniforms>(), 64);

impl FlushUniforms {
    pub fn new(desc: &FlushDescriptor, path_id_granularity: u32) -> Self {
        let target = &desc.render_target;
        let inverse = |x: u32| if x == 0 { 0. } else { 1. / x as f32 };
        let bounds = desc.render_target_update_bounds;
        Self {
            inverse_viewport: [
                2. * inverse(target.width),
                2. * inverse(target.height),
            ],
            render_target_width: target.width,
            render_target_height: target.height,
            color_clear_value: desc.clear_color_rgba8(),
            coverage_clear_value: desc.coverage_clear_value,
            render_target_update_bounds: [bounds.left, bounds.top, bounds.right, bounds.bottom],
            atlas_texture_inverse_size: [
                inverse(desc.atlas_content_width),
                inverse(desc.atlas_content_height),
            ],
            grad_inverse_viewport_y: 2. * inverse(desc.grad_data_height),
            tess_inverse_viewport_y: 2. * inverse(desc.tess_data_height),
            path_id_granularity,
            vertex_discard_value: f32::NAN,
        }
    }
}
