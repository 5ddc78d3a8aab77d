// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use vellum_encoding::{DrawType, InterlockMode, ShaderFeatures, MAX_ATLAS_SIZE};

use crate::{Error, Result};

/// What the device can do, as reported by the backend when the context is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// Fragment shader interlock or raster order groups are available.
    pub supports_raster_ordering: bool,
    /// Fragment shaders can perform atomic operations on storage buffers or textures.
    pub supports_fragment_shader_atomics: bool,
    /// Multisampled render targets are available.
    pub supports_msaa: bool,
    /// Hardware clip planes are available, which `Msaa` mode uses for clip rects.
    pub supports_clip_planes: bool,
    pub supports_clockwise_atomic_rendering: bool,
    pub supports_wireframe: bool,
    /// The atomic resolve can write straight into the final render target while it
    /// transfers from the offscreen color texture.
    pub supports_coalesced_resolve_and_transfer: bool,
    /// The atomic coverage buffer can't be cleared with a load op and needs an explicit
    /// initialization draw.
    pub atomic_pls_init_needs_draw: bool,
    /// Path ids in the coverage buffer are multiplied by this value.
    pub path_id_granularity: u32,
    /// Largest dimension of a 2D texture.
    pub max_texture_size: u32,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            supports_raster_ordering: false,
            supports_fragment_shader_atomics: false,
            supports_msaa: true,
            supports_clip_planes: false,
            supports_clockwise_atomic_rendering: false,
            supports_wireframe: false,
            supports_coalesced_resolve_and_transfer: false,
            atomic_pls_init_needs_draw: false,
            path_id_granularity: 1,
            max_texture_size: 8192,
        }
    }
}

impl PlatformCapabilities {
    /// The feature set of the ubershader for `draw_type`: a permutation that renders any
    /// batch of that draw type correctly, whatever features the batch actually uses.
    pub fn ubershader_features(
        &self,
        draw_type: DrawType,
        interlock_mode: InterlockMode,
    ) -> ShaderFeatures {
        let mut features = ShaderFeatures::mask_for(draw_type, interlock_mode);
        if interlock_mode == InterlockMode::Msaa && !self.supports_clip_planes {
            features.remove(ShaderFeatures::CLIP_RECT);
        }
        features
    }

    /// The largest width or height the coverage atlas may grow to.
    pub fn atlas_max_size(&self) -> u32 {
        self.max_texture_size.min(MAX_ATLAS_SIZE)
    }

    /// Whether `mode` can be used on this device.
    pub fn supports_interlock_mode(&self, mode: InterlockMode) -> bool {
        match mode {
            InterlockMode::RasterOrdering => self.supports_raster_ordering,
            InterlockMode::Atomics => self.supports_fragment_shader_atomics,
            InterlockMode::ClockwiseAtomic => {
                self.supports_fragment_shader_atomics && self.supports_clockwise_atomic_rendering
            }
            InterlockMode::Msaa => self.supports_msaa,
        }
    }

    /// The fastest interlock mode the device supports.
    pub fn preferred_interlock_mode(&self) -> Option<InterlockMode> {
        [
            InterlockMode::RasterOrdering,
            InterlockMode::Atomics,
            InterlockMode::Msaa,
        ]
        .into_iter()
        .find(|mode| self.supports_interlock_mode(*mode))
    }

    /// Checks that a renderer can be created on this device at all.
    pub fn validate(&self) -> Result<()> {
        if self.preferred_interlock_mode().is_none() {
            return Err(Error::MissingCapability(
                "raster ordering, fragment shader atomics or msaa",
            ));
        }
        if self.path_id_granularity == 0 {
            return Err(Error::MissingCapability("nonzero path id granularity"));
        }
        if self.max_texture_size == 0 {
            return Err(Error::MissingCapability("nonzero max texture size"));
        }
        Ok(())
    }
}

/// Limits applied to work submission to get around driver bugs.
///
/// The default is to apply no workarounds at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverWorkarounds {
    /// Break the main render pass once this many instances have been drawn in it.
    pub max_instances_per_render_pass: Option<u32>,
    /// Split instanced draws into draws of at most this many instances.
    pub max_instances_per_draw: Option<u32>,
    /// Resolve multisampled color with a draw instead of a resolve attachment.
    pub manual_msaa_resolve: bool,
}
