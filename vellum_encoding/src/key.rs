// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shader permutation keys.
//!
//! Every draw shader is an "uber shader" whose optional behaviour is switched on with
//! [`ShaderFeatures`]. A [`ShaderKey`] packs a draw type, the subset of features that can
//! actually change the generated code for that draw type, the interlock mode, and any
//! [`ShaderMiscFlags`] into a single integer, so that equivalent permutations share a cache
//! entry.

use bitflags::bitflags;

/// The kind of geometry submitted by a single draw batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrawType {
    /// Standard paths and/or strokes.
    MidpointFanPatches,
    /// Midpoint fans whose AA ramp is split down the center, used for feathered coverage.
    MidpointFanCenterAAPatches,
    /// Just the outer curves of a path; the interior is triangulated on the CPU.
    OuterCurvePatches,
    InteriorTriangulation,
    /// Copies a region of the coverage atlas into the framebuffer.
    AtlasBlit,
    ImageRect,
    ImageMesh,
    /// Clears/initializes pixel local storage when load operations can't.
    AtomicInitialize,
    /// Resolves pixel local storage to the render target in atomic mode.
    AtomicResolve,
    /// Clears or intersects the stencil clip bit.
    StencilClipReset,
}

impl DrawType {
    pub const ALL: [Self; 10] = [
        Self::MidpointFanPatches,
        Self::MidpointFanCenterAAPatches,
        Self::OuterCurvePatches,
        Self::InteriorTriangulation,
        Self::AtlasBlit,
        Self::ImageRect,
        Self::ImageMesh,
        Self::AtomicInitialize,
        Self::AtomicResolve,
        Self::StencilClipReset,
    ];

    pub const fn is_image_draw(self) -> bool {
        matches!(self, Self::ImageRect | Self::ImageMesh)
    }

    /// Whether this draw type renders instanced tessellation patches.
    pub const fn is_patch(self) -> bool {
        matches!(
            self,
            Self::MidpointFanPatches | Self::MidpointFanCenterAAPatches | Self::OuterCurvePatches
        )
    }

    /// The 3-bit identifier of the shader family this draw type uses.
    ///
    /// All patch types share one shader; they only differ in the patch geometry they index.
    pub const fn key(self) -> u32 {
        match self {
            Self::MidpointFanPatches | Self::MidpointFanCenterAAPatches | Self::OuterCurvePatches => {
                0
            }
            Self::InteriorTriangulation => 1,
            Self::AtlasBlit => 2,
            Self::ImageRect => 3,
            Self::ImageMesh => 4,
            Self::AtomicInitialize => 5,
            Self::AtomicResolve => 6,
            Self::StencilClipReset => 7,
        }
    }
}

/// Synchronization method for pixel local storage with overlapping fragments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InterlockMode {
    #[default]
    RasterOrdering,
    Atomics,
    /// Clockwise-only fills with borrowed coverage, built on fragment shader atomics.
    ClockwiseAtomic,
    Msaa,
}

impl InterlockMode {
    pub const ALL: [Self; 4] = [
        Self::RasterOrdering,
        Self::Atomics,
        Self::ClockwiseAtomic,
        Self::Msaa,
    ];

    pub const fn key(self) -> u32 {
        match self {
            Self::RasterOrdering => 0,
            Self::Atomics => 1,
            Self::ClockwiseAtomic => 2,
            Self::Msaa => 3,
        }
    }

    /// Whether draws in this mode use the flush-wide combined shader features.
    pub const fn uses_combined_features(self) -> bool {
        matches!(self, Self::Atomics | Self::ClockwiseAtomic)
    }
}

bitflags! {
    /// Optional shader behaviour that never changes how simple content draws.
    ///
    /// Turning every feature on renders all content correctly; a feature may be turned off
    /// when a batch is known not to need it.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderFeatures: u32 {
        // Whole program features.
        const CLIPPING = 1 << 0;
        const CLIP_RECT = 1 << 1;
        const ADVANCED_BLEND = 1 << 2;
        const FEATHER = 1 << 3;

        // Fragment-only features.
        const EVEN_ODD = 1 << 4;
        const NESTED_CLIPPING = 1 << 5;
        const HSL_BLEND_MODES = 1 << 6;
    }
}

impl ShaderFeatures {
    /// Number of feature bits reserved in a [`ShaderKey`].
    pub const COUNT: u32 = 7;

    /// Features that affect vertex shaders.
    pub const VERTEX_MASK: Self = Self::CLIPPING
        .union(Self::CLIP_RECT)
        .union(Self::ADVANCED_BLEND)
        .union(Self::FEATHER);

    /// Features supported at all by the given interlock mode.
    pub const fn mask_for_interlock(mode: InterlockMode) -> Self {
        match mode {
            InterlockMode::RasterOrdering => Self::all(),
            InterlockMode::Atomics | InterlockMode::ClockwiseAtomic => {
                Self::all().difference(Self::NESTED_CLIPPING)
            }
            InterlockMode::Msaa => Self::CLIP_RECT
                .union(Self::ADVANCED_BLEND)
                .union(Self::HSL_BLEND_MODES)
                .union(Self::FEATHER),
        }
    }

    /// Features that can change the code generated for `draw_type` in `mode`.
    pub const fn mask_for(draw_type: DrawType, mode: InterlockMode) -> Self {
        let mask = match draw_type {
            // Atomic mode has to resolve previous draws, so images consider the same features
            // as path draws there.
            DrawType::ImageRect | DrawType::ImageMesh
                if !matches!(mode, InterlockMode::Atomics) =>
            {
                Self::CLIPPING
                    .union(Self::CLIP_RECT)
                    .union(Self::ADVANCED_BLEND)
                    .union(Self::HSL_BLEND_MODES)
                    .union(Self::FEATHER)
            }
            DrawType::ImageRect
            | DrawType::ImageMesh
            | DrawType::MidpointFanPatches
            | DrawType::MidpointFanCenterAAPatches
            | DrawType::OuterCurvePatches
            | DrawType::InteriorTriangulation
            | DrawType::AtlasBlit
            | DrawType::AtomicResolve => Self::all(),
            DrawType::AtomicInitialize => Self::CLIPPING.union(Self::ADVANCED_BLEND),
            DrawType::StencilClipReset => Self::empty(),
        };
        mask.intersection(Self::mask_for_interlock(mode))
    }
}

bitflags! {
    /// Switches that *do* change the behaviour of a shader.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderMiscFlags: u32 {
        /// Atomic modes only: render color to a standard attachment with fixed-function
        /// blending instead of pixel local storage.
        const FIXED_FUNCTION_COLOR_OUTPUT = 1 << 0;
        /// `AtomicInitialize` only: also store the color clear value.
        const STORE_COLOR_CLEAR = 1 << 1;
        /// `AtomicInitialize` only: swizzle existing framebuffer contents from BGRA to RGBA.
        const SWIZZLE_COLOR_BGRA_TO_RGBA = 1 << 2;
        /// `AtomicResolve` only: resolve straight into the render target when drawing
        /// offscreen, instead of resolving and then copying.
        const COALESCED_RESOLVE_AND_TRANSFER = 1 << 3;
        /// Raster ordering only: the draw is a clockwise fill.
        const CLOCKWISE_FILL = 1 << 4;
    }
}

impl ShaderMiscFlags {
    pub const COUNT: u32 = 5;
}

bitflags! {
    /// Contents of a draw. These don't affect shaders, but they break up batching and
    /// select fixed-function state in some interlock modes.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DrawContents: u32 {
        const OPAQUE_PAINT = 1 << 0;
        const STROKE = 1 << 1;
        const CLOCKWISE_FILL = 1 << 2;
        const NONZERO_FILL = 1 << 3;
        const EVEN_ODD_FILL = 1 << 4;
        const ACTIVE_CLIP = 1 << 5;
        const CLIP_UPDATE = 1 << 6;
        const ADVANCED_BLEND = 1 << 7;
    }
}

bitflags! {
    /// Synchronization a draw batch requires before it executes.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BarrierFlags: u32 {
        /// Pixel local storage must be complete before the atomic resolve reads it.
        const PLS_ATOMIC_PRE_RESOLVE = 1 << 0;
        /// Initialization draws must land before the first atomic draw.
        const PLS_ATOMIC_POST_INIT = 1 << 1;
        /// Overlapping atomic draws.
        const PLS_ATOMIC = 1 << 2;
        /// The batch reads the destination color for blending.
        const DST_BLEND = 1 << 3;
        /// Prior fragment shaders must finish updating borrowed coverage.
        const CLOCKWISE_BORROWED_COVERAGE = 1 << 4;
    }
}

/// The fields of a draw that select shader code.
///
/// Features are masked on construction, so equal permutations compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderProps {
    pub draw_type: DrawType,
    pub features: ShaderFeatures,
    pub interlock_mode: InterlockMode,
    pub misc_flags: ShaderMiscFlags,
}

impl ShaderProps {
    pub fn new(
        draw_type: DrawType,
        features: ShaderFeatures,
        interlock_mode: InterlockMode,
        misc_flags: ShaderMiscFlags,
    ) -> Self {
        Self {
            draw_type,
            features: features & ShaderFeatures::mask_for(draw_type, interlock_mode),
            interlock_mode,
            misc_flags,
        }
    }

    /// The same permutation with `features` substituted.
    pub fn with_features(&self, features: ShaderFeatures) -> Self {
        Self::new(self.draw_type, features, self.interlock_mode, self.misc_flags)
    }

    /// The coarser permutation a vertex shader is built from.
    pub fn vertex(&self) -> Self {
        Self::new(
            self.draw_type,
            self.features & ShaderFeatures::VERTEX_MASK,
            self.interlock_mode,
            ShaderMiscFlags::empty(),
        )
    }

    pub fn key(&self) -> ShaderKey {
        ShaderKey::new(
            self.draw_type,
            self.features,
            self.interlock_mode,
            self.misc_flags,
        )
    }

    pub fn vertex_key(&self) -> VertexShaderKey {
        VertexShaderKey(self.vertex().key())
    }
}

/// A unique integer for one shader permutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderKey(pub u32);

impl ShaderKey {
    const DRAW_TYPE_BITS: u32 = 3;

    pub fn new(
        draw_type: DrawType,
        features: ShaderFeatures,
        interlock_mode: InterlockMode,
        misc_flags: ShaderMiscFlags,
    ) -> Self {
        let features = features & ShaderFeatures::mask_for(draw_type, interlock_mode);
        let mut key = misc_flags.bits();
        key = (key << 2) | interlock_mode.key();
        key = (key << ShaderFeatures::COUNT) | features.bits();
        key = (key << Self::DRAW_TYPE_BITS) | draw_type.key();
        Self(key)
    }

    pub fn draw_type_key(self) -> u32 {
        self.0 & ((1 << Self::DRAW_TYPE_BITS) - 1)
    }

    pub fn features(self) -> ShaderFeatures {
        ShaderFeatures::from_bits_truncate(self.0 >> Self::DRAW_TYPE_BITS)
    }

    pub fn interlock_key(self) -> u32 {
        (self.0 >> (Self::DRAW_TYPE_BITS + ShaderFeatures::COUNT)) & 0x3
    }

    pub fn misc_flags(self) -> ShaderMiscFlags {
        ShaderMiscFlags::from_bits_truncate(
            self.0 >> (Self::DRAW_TYPE_BITS + ShaderFeatures::COUNT + 2),
        )
    }
}

/// Key of a vertex shader: a [`ShaderKey`] with fragment-only state removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexShaderKey(pub ShaderKey);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_fields_round_trip() {
        let features = ShaderFeatures::CLIPPING | ShaderFeatures::EVEN_ODD;
        let misc = ShaderMiscFlags::CLOCKWISE_FILL;
        let key = ShaderKey::new(
            DrawType::InteriorTriangulation,
            features,
            InterlockMode::Atomics,
            misc,
        );
        assert_eq!(key.draw_type_key(), 1);
        assert_eq!(key.features(), features);
        assert_eq!(key.interlock_key(), InterlockMode::Atomics.key());
        assert_eq!(key.misc_flags(), misc);
    }

    #[test]
    fn irrelevant_features_collapse() {
        // Stencil clip resets don't use any features.
        let a = ShaderKey::new(
            DrawType::StencilClipReset,
            ShaderFeatures::all(),
            InterlockMode::Msaa,
            ShaderMiscFlags::empty(),
        );
        let b = ShaderKey::new(
            DrawType::StencilClipReset,
            ShaderFeatures::empty(),
            InterlockMode::Msaa,
            ShaderMiscFlags::empty(),
        );
        assert_eq!(a, b);

        // Nested clipping doesn't exist in atomic mode.
        let c = ShaderKey::new(
            DrawType::MidpointFanPatches,
            ShaderFeatures::CLIPPING | ShaderFeatures::NESTED_CLIPPING,
            InterlockMode::Atomics,
            ShaderMiscFlags::empty(),
        );
        let d = ShaderKey::new(
            DrawType::MidpointFanPatches,
            ShaderFeatures::CLIPPING,
            InterlockMode::Atomics,
            ShaderMiscFlags::empty(),
        );
        assert_eq!(c, d);
    }

    #[test]
    fn patch_types_share_a_shader() {
        let props = |draw_type| {
            ShaderProps::new(
                draw_type,
                ShaderFeatures::FEATHER,
                InterlockMode::RasterOrdering,
                ShaderMiscFlags::empty(),
            )
        };
        assert_eq!(
            props(DrawType::MidpointFanPatches).key(),
            props(DrawType::OuterCurvePatches).key()
        );
        assert_ne!(
            props(DrawType::MidpointFanPatches).key(),
            props(DrawType::InteriorTriangulation).key()
        );
    }

    #[test]
    fn image_masks_depend_on_interlock() {
        let raster = ShaderFeatures::mask_for(DrawType::ImageMesh, InterlockMode::RasterOrdering);
        assert!(!raster.contains(ShaderFeatures::EVEN_ODD));
        let atomics = ShaderFeatures::mask_for(DrawType::ImageMesh, InterlockMode::Atomics);
        assert!(atomics.contains(ShaderFeatures::EVEN_ODD));
        assert!(!atomics.contains(ShaderFeatures::NESTED_CLIPPING));
        let msaa = ShaderFeatures::mask_for(DrawType::ImageRect, InterlockMode::Msaa);
        assert!(!msaa.contains(ShaderFeatures::CLIPPING));
        assert!(msaa.contains(ShaderFeatures::CLIP_RECT));
    }

    #[test]
    fn vertex_key_ignores_fragment_state() {
        let a = ShaderProps::new(
            DrawType::MidpointFanPatches,
            ShaderFeatures::CLIPPING | ShaderFeatures::EVEN_ODD,
            InterlockMode::RasterOrdering,
            ShaderMiscFlags::CLOCKWISE_FILL,
        );
        let b = ShaderProps::new(
            DrawType::MidpointFanPatches,
            ShaderFeatures::CLIPPING | ShaderFeatures::HSL_BLEND_MODES,
            InterlockMode::RasterOrdering,
            ShaderMiscFlags::empty(),
        );
        assert_ne!(a.key(), b.key());
        assert_eq!(a.vertex_key(), b.vertex_key());
    }
}
