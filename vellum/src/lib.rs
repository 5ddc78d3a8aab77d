// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Vellum is the GPU-facing core of a 2D path renderer.
//!
//! It turns a [`FlushDescriptor`](vellum_encoding::FlushDescriptor), a frame's worth of
//! tessellated paths produced on the CPU, into device work while the CPU is already
//! preparing the next frame:
//!
//! - [`AsyncPipelineManager`] compiles shader permutations on a background thread, and hands
//!   out the "ubershader" for a draw type until the exact permutation is ready.
//! - [`BufferRing`] and [`FlushBufferRings`] hold transient per-flush data in rings of
//!   [`BUFFER_RING_SIZE`](vellum_encoding::BUFFER_RING_SIZE) slots.
//! - [`ResourcePool`] and [`ZombiePurgatory`] hold released resources until the frame that
//!   last used them has retired on the GPU.
//! - [`FlushOrchestrator`] sequences the color ramp, tessellation, atlas and main passes of a
//!   flush into a [`Recording`], which a backend replays.
//!
//! Backends implement [`PipelineBackend`] and [`RingStorage`]. With the `wgpu` feature
//! (enabled by default), [`WgpuBackend`], [`WgpuRingStorage`] and [`WgpuEngine`] provide
//! a complete implementation on top of [`wgpu`].
//!
//! ```ignore
//! let caps = PlatformCapabilities { supports_raster_ordering: true, ..Default::default() };
//! let pipelines = Arc::new(AsyncPipelineManager::new(
//!     WgpuBackend::new(device.clone(), sources, pipeline_layout, target_format),
//!     PipelineManagerOptions::default(),
//! ));
//! let mut orchestrator = FlushOrchestrator::new(pipelines, caps, DriverWorkarounds::default());
//! let recording = orchestrator.record_flush(&flush)?;
//! engine.run_recording(&device, &queue, &recording, &targets)?;
//! ```

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
// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
#![allow(missing_docs, reason = "We have many as-yet undocumented items.")]
#![allow(
    missing_debug_implementations,
    unnameable_types,
    unreachable_pub,
    clippy::cast_possible_truncation,
    clippy::missing_assert_message,
    clippy::shadow_unrelated,
    reason = "Deferred"
)]

mod backend;
mod buffer_ring;
mod caps;
mod chunker;
mod flush;
mod pipeline_manager;
mod recording;
mod resource_pool;
mod shader_manager;

#[cfg(feature = "wgpu")]
mod wgpu_engine;

use std::sync::{Mutex, MutexGuard};

use vellum_encoding::ShaderKey;

pub use backend::{FixedPipeline, PipelineBackend, PipelineKey, PipelineProps, PipelineStatus};
pub use buffer_ring::{BufferRing, FlushBufferRings, RingKind, RingStorage};
pub use caps::{DriverWorkarounds, PlatformCapabilities};
pub use chunker::InstanceChunker;
pub use flush::FlushOrchestrator;
pub use pipeline_manager::{AsyncPipelineManager, CompilationMode, PipelineManagerOptions};
pub use recording::{Command, PassDesc, PassKind, Recording, TextureKind};
pub use resource_pool::{
    FrameClock, Pooled, Recycle, ResourcePool, ResourcePoolOptions, ZombiePurgatory,
};
pub use shader_manager::{CacheKey, ShaderCache, VertexShaderManager};

#[cfg(feature = "wgpu")]
pub use wgpu;
#[cfg(feature = "wgpu")]
pub use wgpu_engine::{
    feature_constants, FlushTargets, ImageMeshBuffers, ShaderSources, WgpuBackend, WgpuEngine,
    WgpuPipeline, WgpuRingStorage, WgpuShader, ATLAS_TEXTURE_FORMAT, FEATHER_TEXTURE_FORMAT,
    GRADIENT_TEXTURE_FORMAT, TESSELLATION_TEXTURE_FORMAT,
};

pub use vellum_encoding;

/// Errors that can occur in Vellum.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend failed to create a vertex or fragment shader.
    #[error("Couldn't create shader {key:?}: {message}")]
    ShaderCreation { key: ShaderKey, message: String },
    /// The backend failed to create or link a pipeline.
    #[error("Couldn't create pipeline {key:?}: {message}")]
    PipelineCreation { key: PipelineKey, message: String },
    /// Neither the requested permutation nor its ubershader fallback could be built.
    #[error("The ubershader for {key:?} failed to build: {message}")]
    UbershaderUnavailable { key: ShaderKey, message: String },
    /// One of the pipelines every flush depends on failed to build.
    #[error("Couldn't create the {0:?} pipeline")]
    FixedPipeline(FixedPipeline),
    /// The device can't support any interlock mode.
    #[error("Device is missing a required capability: {0}")]
    MissingCapability(&'static str),

    /// More bytes were requested from a ring slot than it holds.
    #[error("Requested {requested} bytes from a ring of {capacity} byte slots")]
    RingOverflow { requested: usize, capacity: usize },
    /// A ring slot was mapped before the previous one was submitted.
    #[error("Buffer ring is already mapped")]
    RingAlreadyMapped,
    /// A ring slot was submitted without having been mapped.
    #[error("Buffer ring is not mapped")]
    RingNotMapped,

    /// The background compilation thread couldn't be started.
    #[error("Couldn't spawn the pipeline compilation thread")]
    ThreadSpawn(#[from] std::io::Error),

    #[cfg(feature = "wgpu")]
    #[error("wgpu Error from scope")]
    WgpuErrorFromScope(#[from] wgpu::Error),
    /// No WGSL source was supplied for a shader family.
    #[cfg(feature = "wgpu")]
    #[error("No shader source for {0}")]
    MissingShaderSource(&'static str),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Locks `mutex`, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

static_assertions::assert_impl_all!(FrameClock: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_readable() {
        let err = Error::RingOverflow {
            requested: 10,
            capacity: 4,
        };
        assert_eq!(
            err.to_string(),
            "Requested 10 bytes from a ring of 4 byte slots"
        );
        let err = Error::UbershaderUnavailable {
            key: ShaderKey(3),
            message: "bad WGSL".into(),
        };
        assert!(err.to_string().contains("ShaderKey(3)"));
        assert!(err.to_string().ends_with("bad WGSL"));
    }

    #[test]
    fn descriptor_is_send() {
        use vellum_encoding::FlushDescriptor;
        static_assertions::assert_impl_all!(FlushDescriptor: Send, Sync);
    }
}
