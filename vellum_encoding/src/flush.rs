// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The description of a single flush, as produced by the CPU tessellation stage.

use peniko::Color;

use crate::{BarrierFlags, DrawContents, DrawType, InterlockMode, ShaderFeatures, ShaderMiscFlags};

/// Integer rectangle, right and bottom exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IntRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl IntRect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// A rectangle anchored at the origin.
    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub const fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn intersect(&self, other: &Self) -> Self {
        Self::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        )
    }
}

/// What happens to the previous contents of a render target when a pass begins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadAction {
    #[default]
    Clear,
    PreserveRenderTarget,
    DontCare,
}

/// A run of patches rendered into the coverage atlas under one scissor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AtlasBatch {
    pub scissor: IntRect,
    pub base_patch: u32,
    pub patch_count: u32,
}

/// Opaque handle to an image texture owned by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageTextureId(pub u64);

/// Opaque handle to an image mesh (vertex, uv and index buffers) owned by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageMeshId(pub u64);

/// One draw call of the main pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawBatch {
    pub draw_type: DrawType,
    /// Instances for patches, vertices for triangles, indices for image meshes.
    pub element_count: u32,
    pub base_element: u32,
    pub draw_contents: DrawContents,
    pub shader_features: ShaderFeatures,
    pub shader_misc_flags: ShaderMiscFlags,
    /// Synchronization required before this batch can draw.
    pub barriers: BarrierFlags,
    pub image_texture: Option<ImageTextureId>,
    /// Offset of this draw's uniforms in the image-draw uniform ring, in bytes.
    pub image_draw_data_offset: u32,
    pub image_mesh: Option<ImageMeshId>,
}

impl DrawBatch {
    pub fn new(draw_type: DrawType, element_count: u32, base_element: u32) -> Self {
        Self {
            draw_type,
            element_count,
            base_element,
            draw_contents: DrawContents::empty(),
            shader_features: ShaderFeatures::empty(),
            shader_misc_flags: ShaderMiscFlags::empty(),
            barriers: BarrierFlags::empty(),
            image_texture: None,
            image_draw_data_offset: 0,
            image_mesh: None,
        }
    }

    pub fn with_features(mut self, features: ShaderFeatures) -> Self {
        self.shader_features = features;
        self
    }

    pub fn with_contents(mut self, contents: DrawContents) -> Self {
        self.draw_contents = contents;
        self
    }

    pub fn with_barriers(mut self, barriers: BarrierFlags) -> Self {
        self.barriers = barriers;
        self
    }
}

/// The render target a flush draws into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderTargetInfo {
    pub width: u32,
    pub height: u32,
    /// Backend-defined id of the render pass layout this target is compatible with.
    pub render_pass_key: u16,
    /// The target can't be bound directly (e.g. a swapchain texture without storage or
    /// input attachment usage), so the flush renders into an offscreen color texture.
    pub needs_offscreen: bool,
    /// Preserved contents were copied in from a BGRA texture, so an atomic initialization
    /// draw has to swizzle them.
    pub preserved_contents_bgra: bool,
}

/// Everything the GPU stages of one flush need to know.
#[derive(Clone, Debug)]
pub struct FlushDescriptor {
    pub render_target: RenderTargetInfo,
    pub combined_shader_features: ShaderFeatures,
    pub interlock_mode: InterlockMode,
    pub color_load_action: LoadAction,
    pub clear_color: Color,
    pub coverage_clear_value: u32,
    pub render_target_update_bounds: IntRect,

    pub first_path: u32,
    pub first_paint: u32,
    pub first_paint_aux: u32,
    pub first_contour: u32,

    pub grad_span_count: u32,
    pub first_grad_span: u32,
    pub grad_data_height: u32,

    pub tess_vertex_span_count: u32,
    pub first_tess_vertex_span: u32,
    pub tess_data_height: u32,

    pub atlas_fill_batches: Vec<AtlasBatch>,
    pub atlas_stroke_batches: Vec<AtlasBatch>,
    pub atlas_content_width: u32,
    pub atlas_content_height: u32,

    pub draw_list: Vec<DrawBatch>,
    pub wireframe: bool,
    pub is_final_flush_of_frame: bool,
}

impl FlushDescriptor {
    /// An empty flush covering the whole target.
    pub fn new(render_target: RenderTargetInfo, interlock_mode: InterlockMode) -> Self {
        Self {
            render_target,
            combined_shader_features: ShaderFeatures::empty(),
            interlock_mode,
            color_load_action: LoadAction::Clear,
            clear_color: Color::TRANSPARENT,
            coverage_clear_value: 0,
            render_target_update_bounds: IntRect::from_size(
                render_target.width,
                render_target.height,
            ),
            first_path: 0,
            first_paint: 0,
            first_paint_aux: 0,
            first_contour: 0,
            grad_span_count: 0,
            first_grad_span: 0,
            grad_data_height: 0,
            tess_vertex_span_count: 0,
            first_tess_vertex_span: 0,
            tess_data_height: 0,
            atlas_fill_batches: Vec::new(),
            atlas_stroke_batches: Vec::new(),
            atlas_content_width: 0,
            atlas_content_height: 0,
            draw_list: Vec::new(),
            wireframe: false,
            is_final_flush_of_frame: true,
        }
    }

    /// The clear color, premultiplied, as packed RGBA8 with red in the low byte.
    pub fn clear_color_rgba8(&self) -> u32 {
        self.clear_color.premultiply().to_rgba8().to_u32()
    }

    pub fn has_atlas_batches(&self) -> bool {
        !self.atlas_fill_batches.is_empty() || !self.atlas_stroke_batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rects() {
        assert!(IntRect::default().is_empty());
        assert!(IntRect::new(4, 0, 2, 10).is_empty());
        assert!(!IntRect::from_size(1, 1).is_empty());
        let clipped = IntRect::from_size(10, 10).intersect(&IntRect::new(12, 0, 20, 5));
        assert!(clipped.is_empty());
    }

    #[test]
    fn new_descriptor_covers_target() {
        let desc = FlushDescriptor::new(
            RenderTargetInfo {
                width: 64,
                height: 32,
                ..Default::default()
            },
            InterlockMode::Msaa,
        );
        assert_eq!(desc.render_target_update_bounds, IntRect::new(0, 0, 64, 32));
        assert_eq!(desc.clear_color_rgba8(), 0);
        assert!(!desc.has_atlas_batches());
    }
}
