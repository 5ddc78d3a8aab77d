// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CPU-side data model shared by the Vellum flush pipeline.
//!
//! Nothing in this crate talks to a GPU: it describes shader permutations, the contents of
//! a flush, and the byte layouts the shaders expect.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![allow(missing_docs, reason = "We have many as-yet undocumented items.")]
#![allow(
    missing_debug_implementations,
    clippy::cast_possible_truncation,
    clippy::missing_assert_message,
    clippy::missing_panics_doc,
    clippy::exhaustive_enums,
    reason = "Deferred"
)]

mod flush;
mod gaussian;
mod key;
mod layout;
mod patch;

pub use flush::{
    AtlasBatch, DrawBatch, FlushDescriptor, ImageMeshId, ImageTextureId, IntRect, LoadAction,
    RenderTargetInfo,
};
pub use gaussian::{
    gaussian_integral_table, gaussian_integral_table_f16, inverse_gaussian_integral_table,
    inverse_gaussian_integral_table_f16, FEATHER_TEXTURE_STDDEVS, GAUSSIAN_TABLE_SIZE,
};
pub use key::{
    BarrierFlags, DrawContents, DrawType, InterlockMode, ShaderFeatures, ShaderKey,
    ShaderMiscFlags, ShaderProps, VertexShaderKey,
};
pub use layout::{
    FlushUniforms, GradientSpan, ImageRectVertex, SegmentCounts, TessVertexSpan, BUFFER_RING_SIZE,
    GRAD_SPAN_TRI_STRIP_VERTEX_COUNT, GRAD_TEXTURE_WIDTH, GRAD_TEXTURE_WIDTH_IN_SIMPLE_RAMPS,
    IMAGE_RECT_INDICES, IMAGE_RECT_VERTICES, MAX_ATLAS_SIZE, TESS_SPAN_INDICES, TESS_TEXTURE_WIDTH,
    TESS_TEXTURE_WIDTH_LOG2, VERTEX_BUFFER_ALIGNMENT,
};
pub use patch::{
    patch_base_index, patch_border_index_count, patch_index_count, patch_range, PatchBuffers,
    PatchRange, PatchVertex, MIDPOINT_FAN_CENTER_AA_PATCH_BASE_INDEX,
    MIDPOINT_FAN_CENTER_AA_PATCH_INDEX_COUNT, MIDPOINT_FAN_CENTER_AA_PATCH_VERTEX_COUNT,
    MIDPOINT_FAN_PATCH_BASE_INDEX, MIDPOINT_FAN_PATCH_BORDER_INDEX_COUNT,
    MIDPOINT_FAN_PATCH_INDEX_COUNT, MIDPOINT_FAN_PATCH_SEGMENT_SPAN,
    MIDPOINT_FAN_PATCH_VERTEX_COUNT, OUTER_CURVE_PATCH_BASE_INDEX, OUTER_CURVE_PATCH_INDEX_COUNT,
    OUTER_CURVE_PATCH_SEGMENT_SPAN, OUTER_CURVE_PATCH_VERTEX_COUNT, PATCH_INDEX_BUFFER_COUNT,
    PATCH_VERTEX_BUFFER_COUNT,
};
