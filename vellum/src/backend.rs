// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The interface between the pipeline caches and a graphics API.

use vellum_encoding::{DrawType, InterlockMode, ShaderFeatures, ShaderKey, ShaderProps};

use crate::Result;

/// Everything that determines the identity of a draw pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineProps {
    pub shader: ShaderProps,
    pub wireframe: bool,
    /// Backend-defined id of the render pass layout the pipeline is compatible with.
    pub render_pass_key: u16,
}

impl PipelineProps {
    pub fn new(shader: ShaderProps) -> Self {
        Self {
            shader,
            wireframe: false,
            render_pass_key: 0,
        }
    }

    pub fn draw_type(&self) -> DrawType {
        self.shader.draw_type
    }

    pub fn interlock_mode(&self) -> InterlockMode {
        self.shader.interlock_mode
    }

    /// The same pipeline state with a different set of shader features.
    pub fn with_features(&self, features: ShaderFeatures) -> Self {
        Self {
            shader: self.shader.with_features(features),
            ..*self
        }
    }

    pub fn key(&self) -> PipelineKey {
        PipelineKey::new(self.shader.key(), self.wireframe, self.render_pass_key)
    }
}

/// A [`ShaderKey`] extended with the fixed function state baked into a pipeline.
///
/// Equal keys always produce interchangeable pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey(pub u64);

impl PipelineKey {
    const WIREFRAME_SHIFT: u32 = 32;
    const RENDER_PASS_SHIFT: u32 = 33;

    pub fn new(shader_key: ShaderKey, wireframe: bool, render_pass_key: u16) -> Self {
        Self(
            u64::from(shader_key.0)
                | (u64::from(wireframe) << Self::WIREFRAME_SHIFT)
                | (u64::from(render_pass_key) << Self::RENDER_PASS_SHIFT),
        )
    }

    pub fn shader_key(self) -> ShaderKey {
        ShaderKey(self.0 as u32)
    }

    pub fn wireframe(self) -> bool {
        (self.0 >> Self::WIREFRAME_SHIFT) & 1 != 0
    }

    pub fn render_pass_key(self) -> u16 {
        (self.0 >> Self::RENDER_PASS_SHIFT) as u16
    }
}

/// Where an asynchronously created pipeline is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    NotReady,
    Ready,
    Errored,
}

/// Pipelines that don't depend on a shader permutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FixedPipeline {
    /// Renders gradient spans into the color ramp texture.
    ColorRamp,
    /// Evaluates curves into the tessellation texture.
    Tessellate,
    /// Renders feathered fills into the coverage atlas, blending additively.
    AtlasFill,
    /// Renders feathered strokes into the coverage atlas, blending with max.
    AtlasStroke,
}

impl FixedPipeline {
    pub const ALL: [Self; 4] = [
        Self::ColorRamp,
        Self::Tessellate,
        Self::AtlasFill,
        Self::AtlasStroke,
    ];
}

/// A graphics API the pipeline caches can build programs with.
///
/// Every method can be called from the background compilation thread, so implementations
/// must be shareable across threads. Creation may complete lazily: a pipeline whose
/// [`pipeline_status`](Self::pipeline_status) is [`PipelineStatus::NotReady`] is not drawn
/// with until it reports ready.
pub trait PipelineBackend: Send + Sync + 'static {
    type VertexShader: Send + Sync + 'static;
    type FragmentShader: Send + Sync + 'static;
    type Pipeline: Send + Sync + 'static;

    /// Compiles the vertex shader for `props`, which has already been reduced to the
    /// features a vertex shader depends on.
    fn create_vertex_shader(&self, props: &ShaderProps) -> Result<Self::VertexShader>;

    fn create_fragment_shader(&self, props: &ShaderProps) -> Result<Self::FragmentShader>;

    /// Links a pipeline.
    fn create_pipeline(
        &self,
        props: &PipelineProps,
        vertex: &Self::VertexShader,
        fragment: &Self::FragmentShader,
    ) -> Result<Self::Pipeline>;

    fn create_fixed_pipeline(&self, kind: FixedPipeline) -> Result<Self::Pipeline>;

    fn pipeline_status(&self, pipeline: &Self::Pipeline) -> PipelineStatus;

    /// Gives a backend that compiles in stages the chance to make progress on the calling
    /// thread. Returns whether the pipeline is now ready.
    fn advance_creation(&self, pipeline: &Self::Pipeline) -> bool {
        let _ = pipeline;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_encoding::ShaderMiscFlags;

    #[test]
    fn pipeline_key_extends_shader_key() {
        let shader = ShaderProps::new(
            DrawType::ImageRect,
            ShaderFeatures::CLIPPING,
            InterlockMode::Msaa,
            ShaderMiscFlags::empty(),
        );
        let mut props = PipelineProps::new(shader);
        let plain = props.key();
        props.wireframe = true;
        props.render_pass_key = 0xbeef;
        let key = props.key();
        assert_ne!(plain, key);
        assert_eq!(key.shader_key(), shader.key());
        assert!(key.wireframe());
        assert_eq!(key.render_pass_key(), 0xbeef);
        assert_eq!(plain.shader_key(), key.shader_key());
    }
}
