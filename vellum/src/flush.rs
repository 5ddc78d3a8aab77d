// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Turns a [`FlushDescriptor`] into a [`Recording`].
//!
//! A flush runs in four stages, each reading what the previous ones produced:
//!
//! 1. Gradient spans are rendered into the color ramp texture.
//! 2. Curves are evaluated into the tessellation texture, which the patch vertex shaders
//!    read.
//! 3. Feathered paths are rendered into the coverage atlas.
//! 4. The draw list is rendered into the target, followed by any resolve or copy back.

use std::collections::HashMap;
use std::sync::Arc;

use vellum_encoding::{
    patch_range, AtlasBatch, BarrierFlags, DrawBatch, DrawContents, DrawType, FlushDescriptor, InterlockMode,
    LoadAction, ShaderFeatures, ShaderMiscFlags, ShaderProps, GRAD_TEXTURE_WIDTH,
    TESS_TEXTURE_WIDTH,
};

use crate::recording::{Command, PassDesc, PassKind, Recording, TextureKind};
use crate::{
    AsyncPipelineManager, DriverWorkarounds, Error, FixedPipeline, InstanceChunker,
    PipelineBackend, PipelineProps, PipelineStatus, PlatformCapabilities, Result,
};

/// Records flushes, fetching draw pipelines from an [`AsyncPipelineManager`].
pub struct FlushOrchestrator<B: PipelineBackend> {
    pipelines: Arc<AsyncPipelineManager<B>>,
    caps: PlatformCapabilities,
    workarounds: DriverWorkarounds,
    fixed_pipelines: HashMap<FixedPipeline, Arc<B::Pipeline>>,
}

impl<B: PipelineBackend> FlushOrchestrator<B> {
    pub fn new(
        pipelines: Arc<AsyncPipelineManager<B>>,
        caps: PlatformCapabilities,
        workarounds: DriverWorkarounds,
    ) -> Self {
        Self {
            pipelines,
            caps,
            workarounds,
            fixed_pipelines: HashMap::new(),
        }
    }

    pub fn caps(&self) -> &PlatformCapabilities {
        &self.caps
    }

    pub fn workarounds(&self) -> &DriverWorkarounds {
        &self.workarounds
    }

    pub fn pipelines(&self) -> &Arc<AsyncPipelineManager<B>> {
        &self.pipelines
    }

    fn fixed_pipeline(&mut self, kind: FixedPipeline) -> Result<Arc<B::Pipeline>> {
        if let Some(pipeline) = self.fixed_pipelines.get(&kind) {
            return Ok(pipeline.clone());
        }
        let backend = self.pipelines.backend();
        let pipeline = backend.create_fixed_pipeline(kind).map_err(|err| {
            log::error!("Failed to create the {kind:?} pipeline: {err}");
            Error::FixedPipeline(kind)
        })?;
        if backend.pipeline_status(&pipeline) == PipelineStatus::Errored {
            log::error!("The {kind:?} pipeline failed to compile");
            return Err(Error::FixedPipeline(kind));
        }
        let pipeline = Arc::new(pipeline);
        self.fixed_pipelines.insert(kind, pipeline.clone());
        Ok(pipeline)
    }

    /// Records every GPU stage of `desc`.
    ///
    /// Nothing is recorded if the flush doesn't update any pixels.
    pub fn record_flush(&mut self, desc: &FlushDescriptor) -> Result<Recording<B::Pipeline>> {
        let mut recording = Recording::default();
        if desc.render_target_update_bounds.is_empty() {
            log::trace!("Skipping flush with empty update bounds");
            return Ok(recording);
        }
        self.record_gradients(desc, &mut recording)?;
        self.record_tessellation(desc, &mut recording)?;
        self.record_atlas(desc, &mut recording)?;
        self.record_draws(desc, &mut recording)?;
        Ok(recording)
    }

    fn record_gradients(
        &mut self,
        desc: &FlushDescriptor,
        recording: &mut Recording<B::Pipeline>,
    ) -> Result<()> {
        if desc.grad_span_count > 0 {
            let pipeline = self.fixed_pipeline(FixedPipeline::ColorRamp)?;
            recording.push(Command::BeginPass(PassDesc::cleared(
                PassKind::Gradient,
                GRAD_TEXTURE_WIDTH,
                desc.grad_data_height,
            )));
            recording.push(Command::SetPipeline(pipeline));
            for (instance_count, base_instance) in InstanceChunker::with_limit(
                desc.grad_span_count,
                desc.first_grad_span,
                self.workarounds.max_instances_per_draw,
            ) {
                recording.push(Command::DrawGradientSpans {
                    instance_count,
                    base_instance,
                });
            }
            recording.push(Command::EndPass);
        }
        recording.push(Command::TextureReady(TextureKind::Gradient));
        Ok(())
    }

    fn record_tessellation(
        &mut self,
        desc: &FlushDescriptor,
        recording: &mut Recording<B::Pipeline>,
    ) -> Result<()> {
        if desc.tess_vertex_span_count > 0 {
            let pipeline = self.fixed_pipeline(FixedPipeline::Tessellate)?;
            recording.push(Command::BeginPass(PassDesc::cleared(
                PassKind::Tessellation,
                TESS_TEXTURE_WIDTH,
                desc.tess_data_height,
            )));
            recording.push(Command::SetPipeline(pipeline));
            for (instance_count, base_instance) in InstanceChunker::with_limit(
                desc.tess_vertex_span_count,
                desc.first_tess_vertex_span,
                self.workarounds.max_instances_per_draw,
            ) {
                recording.push(Command::DrawTessellationSpans {
                    instance_count,
                    base_instance,
                });
            }
            recording.push(Command::EndPass);
        }
        // The patch vertex shaders read this texture.
        recording.push(Command::TextureReady(TextureKind::Tessellation));
        Ok(())
    }

    fn record_atlas(
        &mut self,
        desc: &FlushDescriptor,
        recording: &mut Recording<B::Pipeline>,
    ) -> Result<()> {
        if !desc.has_atlas_batches() {
            return Ok(());
        }
        recording.push(Command::BeginPass(PassDesc::cleared(
            PassKind::Atlas,
            desc.atlas_content_width,
            desc.atlas_content_height,
        )));
        if !desc.atlas_fill_batches.is_empty() {
            let pipeline = self.fixed_pipeline(FixedPipeline::AtlasFill)?;
            recording.push(Command::SetPipeline(pipeline));
            self.record_atlas_batches(
                &desc.atlas_fill_batches,
                DrawType::MidpointFanCenterAAPatches,
                false,
                recording,
            );
        }
        if !desc.atlas_stroke_batches.is_empty() {
            let pipeline = self.fixed_pipeline(FixedPipeline::AtlasStroke)?;
            recording.push(Command::SetPipeline(pipeline));
            // Strokes only need the antialiasing border.
            self.record_atlas_batches(
                &desc.atlas_stroke_batches,
                DrawType::MidpointFanPatches,
                true,
                recording,
            );
        }
        recording.push(Command::EndPass);
        recording.push(Command::TextureReady(TextureKind::Atlas));
        Ok(())
    }

    fn record_atlas_batches(
        &self,
        batches: &[AtlasBatch],
        draw_type: DrawType,
        border_only: bool,
        recording: &mut Recording<B::Pipeline>,
    ) {
        let Some(range) = patch_range(draw_type) else {
            return;
        };
        let index_count = if border_only {
            range.border_index_count
        } else {
            range.index_count
        };
        for batch in batches {
            recording.push(Command::SetScissor(batch.scissor));
            for (instance_count, base_instance) in InstanceChunker::with_limit(
                batch.patch_count,
                batch.base_patch,
                self.workarounds.max_instances_per_draw,
            ) {
                recording.push(Command::DrawPatches {
                    draw_type,
                    index_count,
                    base_index: range.base_index,
                    instance_count,
                    base_instance,
                });
            }
        }
    }

    fn record_draws(
        &mut self,
        desc: &FlushDescriptor,
        recording: &mut Recording<B::Pipeline>,
    ) -> Result<()> {
        let target = &desc.render_target;
        let interlock_mode = desc.interlock_mode;
        let coalesced = interlock_mode == InterlockMode::Atomics
            && target.needs_offscreen
            && self.caps.supports_coalesced_resolve_and_transfer
            && desc
                .draw_list
                .iter()
                .any(|batch| batch.draw_type == DrawType::AtomicResolve);

        let mut pass = MainPass {
            recording,
            desc: PassDesc {
                kind: PassKind::Main,
                load: desc.color_load_action,
                width: target.width,
                height: target.height,
                clear_color: desc.clear_color_rgba8(),
                coverage_clear_value: desc.coverage_clear_value,
                offscreen: target.needs_offscreen,
                resume: false,
            },
            instances_in_pass: 0,
            max_instances_per_pass: self.workarounds.max_instances_per_render_pass,
        };
        pass.recording.push(Command::BeginPass(pass.desc));
        pass.recording.push(Command::BindFlushResources);

        // Without a load op that can initialize atomic coverage, the pass starts with an
        // initialization draw, even if the draw list has none.
        let init_needs_draw =
            interlock_mode == InterlockMode::Atomics && self.caps.atomic_pls_init_needs_draw;
        let implicit_init = (init_needs_draw
            && !desc
                .draw_list
                .iter()
                .any(|batch| batch.draw_type == DrawType::AtomicInitialize))
        .then(|| DrawBatch::new(DrawType::AtomicInitialize, 1, 0));

        let mut bound: Option<Arc<B::Pipeline>> = None;
        let mut pending_barriers = BarrierFlags::empty();
        for batch in implicit_init.iter().chain(&desc.draw_list) {
            if batch.draw_type == DrawType::AtomicInitialize && !init_needs_draw {
                // Coverage is initialized by the pass's load action.
                continue;
            }
            if batch.element_count == 0
                && (batch.draw_type.is_patch() || uses_triangle_vertices(batch.draw_type))
            {
                continue;
            }
            let props = self.draw_pipeline_props(desc, batch, coalesced);
            let pipeline = self.pipelines.try_get_pipeline(&props, &self.caps)?;
            if !bound
                .as_ref()
                .is_some_and(|bound| Arc::ptr_eq(bound, &pipeline))
            {
                pass.recording.push(Command::SetPipeline(pipeline.clone()));
                bound = Some(pipeline);
            }
            let barriers = batch.barriers | std::mem::take(&mut pending_barriers);
            if !barriers.is_empty() {
                pass.recording.push(Command::Barrier(barriers));
            }
            if batch.draw_type == DrawType::AtomicInitialize {
                pending_barriers = BarrierFlags::PLS_ATOMIC_POST_INIT;
            }
            self.record_geometry(batch, &mut pass);
        }

        pass.recording.push(Command::EndPass);
        if interlock_mode == InterlockMode::Msaa && self.workarounds.manual_msaa_resolve {
            pass.recording.push(Command::ResolveMsaa);
        }
        if target.needs_offscreen && !coalesced {
            pass.recording.push(Command::CopyOffscreenToTarget {
                bounds: desc.render_target_update_bounds,
            });
        }
        Ok(())
    }

    fn draw_pipeline_props(
        &self,
        desc: &FlushDescriptor,
        batch: &DrawBatch,
        coalesced: bool,
    ) -> PipelineProps {
        let interlock_mode = desc.interlock_mode;
        let features = if interlock_mode.uses_combined_features() {
            desc.combined_shader_features
        } else {
            batch.shader_features
        };
        let mut misc_flags = batch.shader_misc_flags;
        if interlock_mode == InterlockMode::Atomics
            && !features.contains(ShaderFeatures::ADVANCED_BLEND)
        {
            misc_flags |= ShaderMiscFlags::FIXED_FUNCTION_COLOR_OUTPUT;
        }
        if interlock_mode == InterlockMode::RasterOrdering
            && batch.draw_contents.contains(DrawContents::CLOCKWISE_FILL)
        {
            misc_flags |= ShaderMiscFlags::CLOCKWISE_FILL;
        }
        if coalesced && batch.draw_type == DrawType::AtomicResolve {
            misc_flags |= ShaderMiscFlags::COALESCED_RESOLVE_AND_TRANSFER;
        }
        if batch.draw_type == DrawType::AtomicInitialize {
            match desc.color_load_action {
                LoadAction::Clear => misc_flags |= ShaderMiscFlags::STORE_COLOR_CLEAR,
                LoadAction::PreserveRenderTarget if desc.render_target.preserved_contents_bgra => {
                    misc_flags |= ShaderMiscFlags::SWIZZLE_COLOR_BGRA_TO_RGBA;
                }
                _ => {}
            }
        }
        PipelineProps {
            shader: ShaderProps::new(batch.draw_type, features, interlock_mode, misc_flags),
            wireframe: desc.wireframe && self.caps.supports_wireframe,
            render_pass_key: desc.render_target.render_pass_key,
        }
    }

    fn record_geometry(&self, batch: &DrawBatch, pass: &mut MainPass<'_, B::Pipeline>) {
        let draw_type = batch.draw_type;
        if let Some(range) = patch_range(draw_type) {
            for (count, base) in InstanceChunker::with_limit(
                batch.element_count,
                batch.base_element,
                self.workarounds.max_instances_per_draw,
            ) {
                pass.draw_instanced(count, base, |instance_count, base_instance| {
                    Command::DrawPatches {
                        draw_type,
                        index_count: range.index_count,
                        base_index: range.base_index,
                        instance_count,
                        base_instance,
                    }
                });
            }
            return;
        }
        let command = match draw_type {
            DrawType::InteriorTriangulation | DrawType::AtlasBlit | DrawType::StencilClipReset => {
                Command::DrawTriangles {
                    vertex_count: batch.element_count,
                    base_vertex: batch.base_element,
                }
            }
            DrawType::ImageRect => Command::DrawImageRect {
                texture: batch.image_texture,
                draw_data_offset: batch.image_draw_data_offset,
            },
            DrawType::ImageMesh => Command::DrawImageMesh {
                texture: batch.image_texture,
                mesh: batch.image_mesh,
                index_count: batch.element_count,
                draw_data_offset: batch.image_draw_data_offset,
            },
            DrawType::AtomicResolve => Command::DrawResolve,
            DrawType::AtomicInitialize => Command::DrawAtomicInitialize,
            DrawType::MidpointFanPatches
            | DrawType::MidpointFanCenterAAPatches
            | DrawType::OuterCurvePatches => return,
        };
        pass.recording.push(command);
    }
}

fn uses_triangle_vertices(draw_type: DrawType) -> bool {
    matches!(
        draw_type,
        DrawType::InteriorTriangulation | DrawType::AtlasBlit | DrawType::StencilClipReset
    )
}

/// The main render pass, split into several passes when a driver limits how many instances
/// one render pass may draw.
struct MainPass<'a, P> {
    recording: &'a mut Recording<P>,
    desc: PassDesc,
    instances_in_pass: u32,
    max_instances_per_pass: Option<u32>,
}

impl<P> MainPass<'_, P> {
    fn draw_instanced(
        &mut self,
        mut count: u32,
        mut base: u32,
        command: impl Fn(u32, u32) -> Command<P>,
    ) {
        while count > 0 {
            let chunk = match self.max_instances_per_pass {
                Some(max) => {
                    let max = max.max(1);
                    if self.instances_in_pass >= max {
                        self.interrupt();
                    }
                    count.min(max - self.instances_in_pass)
                }
                None => count,
            };
            self.recording.push(command(chunk, base));
            self.instances_in_pass = self.instances_in_pass.saturating_add(chunk);
            count -= chunk;
            base = base.wrapping_add(chunk);
        }
    }

    /// Ends the pass and continues in a new one that keeps the rendered contents. Engines
    /// restore the pipeline and flush resources that were bound.
    fn interrupt(&mut self) {
        log::trace!(
            "Interrupting render pass after {} instances",
            self.instances_in_pass
        );
        self.recording.push(Command::EndPass);
        self.desc.load = LoadAction::PreserveRenderTarget;
        self.desc.resume = true;
        self.recording.push(Command::BeginPass(self.desc));
        self.instances_in_pass = 0;
    }
}
