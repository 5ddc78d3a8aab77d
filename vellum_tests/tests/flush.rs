// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recording flushes: stage order, pipeline binding, barriers and pass splitting.

use std::sync::Arc;

use vellum::{
    AsyncPipelineManager, Command, CompilationMode, DriverWorkarounds, Error, FixedPipeline,
    FlushOrchestrator, InstanceChunker, PassKind, PipelineManagerOptions, PlatformCapabilities,
    Recording, TextureKind,
};
use vellum_encoding::{
    AtlasBatch, BarrierFlags, DrawBatch, DrawContents, DrawType, FlushDescriptor, ImageTextureId,
    IntRect, InterlockMode, LoadAction, RenderTargetInfo, ShaderFeatures, ShaderMiscFlags,
    OUTER_CURVE_PATCH_INDEX_COUNT,
};
use vellum_tests::{init_logging, MockBackend, MockPipeline};

fn orchestrator_with(
    backend: MockBackend,
    caps: PlatformCapabilities,
    workarounds: DriverWorkarounds,
) -> FlushOrchestrator<MockBackend> {
    init_logging();
    let manager = AsyncPipelineManager::new(
        backend,
        PipelineManagerOptions {
            compilation_mode: CompilationMode::AlwaysSynchronous,
            ..Default::default()
        },
    );
    FlushOrchestrator::new(Arc::new(manager), caps, workarounds)
}

fn orchestrator(workarounds: DriverWorkarounds) -> FlushOrchestrator<MockBackend> {
    orchestrator_with(
        MockBackend::new(),
        PlatformCapabilities {
            supports_raster_ordering: true,
            supports_fragment_shader_atomics: true,
            ..Default::default()
        },
        workarounds,
    )
}

fn descriptor(interlock_mode: InterlockMode) -> FlushDescriptor {
    FlushDescriptor::new(
        RenderTargetInfo {
            width: 64,
            height: 48,
            ..Default::default()
        },
        interlock_mode,
    )
}

/// A compact description of each command, for comparing whole recordings.
fn summarize(recording: &Recording<MockPipeline>) -> Vec<String> {
    recording
        .iter()
        .map(|command| match command {
            Command::BeginPass(desc) if desc.resume => format!("Resume({:?})", desc.kind),
            Command::BeginPass(desc) => format!("Begin({:?})", desc.kind),
            Command::SetPipeline(pipeline) => match &**pipeline {
                MockPipeline::Fixed(kind) => format!("Fixed({kind:?})"),
                MockPipeline::Draw(props) => format!("Pipeline({:?})", props.draw_type()),
            },
            Command::SetScissor(_) => "Scissor".into(),
            Command::DrawGradientSpans { instance_count, .. } => {
                format!("GradientSpans({instance_count})")
            }
            Command::DrawTessellationSpans { instance_count, .. } => {
                format!("TessSpans({instance_count})")
            }
            Command::DrawPatches {
                instance_count,
                base_instance,
                ..
            } => format!("Patches({instance_count}@{base_instance})"),
            Command::DrawTriangles { vertex_count, .. } => format!("Triangles({vertex_count})"),
            Command::DrawImageRect { .. } => "ImageRect".into(),
            Command::DrawImageMesh { .. } => "ImageMesh".into(),
            Command::DrawAtomicInitialize => "Init".into(),
            Command::DrawResolve => "Resolve".into(),
            Command::Barrier(_) => "Barrier".into(),
            Command::TextureReady(kind) => format!("Ready({kind:?})"),
            Command::BindFlushResources => "Bind".into(),
            Command::EndPass => "End".into(),
            Command::ResolveMsaa => "ResolveMsaa".into(),
            Command::CopyOffscreenToTarget { .. } => "Copy".into(),
        })
        .collect()
}

/// The draw pipelines bound, in order.
fn draw_pipelines(recording: &Recording<MockPipeline>) -> Vec<vellum::PipelineProps> {
    recording
        .iter()
        .filter_map(|command| match command {
            Command::SetPipeline(pipeline) => pipeline.props().copied(),
            _ => None,
        })
        .collect()
}

#[test]
fn stages_run_in_dependency_order() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.grad_span_count = 3;
    desc.grad_data_height = 1;
    desc.tess_vertex_span_count = 5;
    desc.tess_data_height = 2;
    desc.atlas_content_width = 16;
    desc.atlas_content_height = 16;
    desc.atlas_fill_batches.push(AtlasBatch {
        scissor: IntRect::new(0, 0, 16, 16),
        base_patch: 0,
        patch_count: 2,
    });
    desc.draw_list
        .push(DrawBatch::new(DrawType::OuterCurvePatches, 4, 2));
    desc.draw_list
        .push(DrawBatch::new(DrawType::InteriorTriangulation, 9, 0));

    let recording = orchestrator.record_flush(&desc).unwrap();
    assert_eq!(
        summarize(&recording),
        [
            "Begin(Gradient)",
            "Fixed(ColorRamp)",
            "GradientSpans(3)",
            "End",
            "Ready(Gradient)",
            "Begin(Tessellation)",
            "Fixed(Tessellate)",
            "TessSpans(5)",
            "End",
            "Ready(Tessellation)",
            "Begin(Atlas)",
            "Fixed(AtlasFill)",
            "Scissor",
            "Patches(2@0)",
            "End",
            "Ready(Atlas)",
            "Begin(Main)",
            "Bind",
            "Pipeline(OuterCurvePatches)",
            "Patches(4@2)",
            "Pipeline(InteriorTriangulation)",
            "Triangles(9)",
            "End",
        ]
    );
    let main = recording.passes().last().unwrap();
    assert_eq!(main.load, LoadAction::Clear);
    assert_eq!((main.width, main.height), (64, 48));

    let patches = recording.iter().rev().find_map(|command| match command {
        Command::DrawPatches {
            draw_type,
            index_count,
            ..
        } => Some((*draw_type, *index_count)),
        _ => None,
    });
    assert_eq!(
        patches,
        Some((DrawType::OuterCurvePatches, OUTER_CURVE_PATCH_INDEX_COUNT))
    );
}

#[test]
fn fixed_pipelines_are_built_once() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.grad_span_count = 1;
    orchestrator.record_flush(&desc).unwrap();
    orchestrator.record_flush(&desc).unwrap();
    let backend = orchestrator.pipelines().backend();
    assert_eq!(backend.fixed_builds(FixedPipeline::ColorRamp), 1);
    assert_eq!(backend.fixed_builds(FixedPipeline::Tessellate), 0);
}

#[test]
fn failed_fixed_pipelines_fail_the_flush() {
    let backend = MockBackend::new();
    backend.fail_fixed(FixedPipeline::Tessellate);
    let mut orchestrator = orchestrator_with(
        backend,
        PlatformCapabilities::default(),
        DriverWorkarounds::default(),
    );
    let mut desc = descriptor(InterlockMode::Msaa);
    desc.tess_vertex_span_count = 1;
    assert!(matches!(
        orchestrator.record_flush(&desc),
        Err(Error::FixedPipeline(FixedPipeline::Tessellate))
    ));
}

#[test]
fn identical_pipelines_are_bound_once() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    let batch = DrawBatch::new(DrawType::MidpointFanPatches, 2, 0)
        .with_features(ShaderFeatures::EVEN_ODD);
    desc.draw_list.push(batch);
    desc.draw_list.push(DrawBatch {
        base_element: 2,
        ..batch
    });
    desc.draw_list.push(
        DrawBatch::new(DrawType::MidpointFanPatches, 1, 4)
            .with_features(ShaderFeatures::CLIPPING),
    );
    // Empty batches don't draw or bind anything.
    desc.draw_list
        .push(DrawBatch::new(DrawType::OuterCurvePatches, 0, 5));

    let recording = orchestrator.record_flush(&desc).unwrap();
    let pipelines = draw_pipelines(&recording);
    assert_eq!(pipelines.len(), 2);
    assert_eq!(pipelines[0].shader.features, ShaderFeatures::EVEN_ODD);
    assert_eq!(pipelines[1].shader.features, ShaderFeatures::CLIPPING);
    assert_eq!(
        orchestrator
            .pipelines()
            .backend()
            .pipeline_builds(&pipelines[0]),
        1
    );
}

#[test]
fn atomic_flushes_resolve_after_a_barrier() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::Atomics);
    desc.combined_shader_features = ShaderFeatures::CLIPPING;
    desc.draw_list
        .push(DrawBatch::new(DrawType::AtomicInitialize, 1, 0));
    desc.draw_list
        .push(DrawBatch::new(DrawType::MidpointFanPatches, 3, 0));
    desc.draw_list.push(
        DrawBatch::new(DrawType::AtomicResolve, 1, 0)
            .with_barriers(BarrierFlags::PLS_ATOMIC_PRE_RESOLVE),
    );

    let recording = orchestrator.record_flush(&desc).unwrap();
    let summary = summarize(&recording);
    assert_eq!(
        summary[summary.len() - 6..],
        [
            "Pipeline(MidpointFanPatches)",
            "Patches(3@0)",
            "Pipeline(AtomicResolve)",
            "Barrier",
            "Resolve",
            "End",
        ]
    );
    for props in draw_pipelines(&recording) {
        assert_ne!(props.draw_type(), DrawType::AtomicInitialize);
        // Atomic mode draws every batch with the flush's combined features.
        assert_eq!(props.shader.features, ShaderFeatures::CLIPPING);
        assert!(props
            .shader
            .misc_flags
            .contains(ShaderMiscFlags::FIXED_FUNCTION_COLOR_OUTPUT));
    }
}

#[test]
fn devices_without_coverage_load_ops_draw_the_initialization() {
    let caps = PlatformCapabilities {
        supports_fragment_shader_atomics: true,
        atomic_pls_init_needs_draw: true,
        ..Default::default()
    };
    let mut orchestrator = orchestrator_with(MockBackend::new(), caps, DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::Atomics);
    desc.draw_list
        .push(DrawBatch::new(DrawType::MidpointFanPatches, 2, 0));
    desc.draw_list.push(
        DrawBatch::new(DrawType::AtomicResolve, 1, 0)
            .with_barriers(BarrierFlags::PLS_ATOMIC_PRE_RESOLVE),
    );

    let recording = orchestrator.record_flush(&desc).unwrap();
    assert_eq!(
        summarize(&recording)[2..],
        [
            "Begin(Main)",
            "Bind",
            "Pipeline(AtomicInitialize)",
            "Init",
            "Pipeline(MidpointFanPatches)",
            "Barrier",
            "Patches(2@0)",
            "Pipeline(AtomicResolve)",
            "Barrier",
            "Resolve",
            "End",
        ]
    );
    let barriers: Vec<_> = recording
        .iter()
        .filter_map(|command| match command {
            Command::Barrier(flags) => Some(*flags),
            _ => None,
        })
        .collect();
    assert_eq!(
        barriers,
        [
            BarrierFlags::PLS_ATOMIC_POST_INIT,
            BarrierFlags::PLS_ATOMIC_PRE_RESOLVE
        ]
    );
    let init = &draw_pipelines(&recording)[0];
    assert_eq!(init.draw_type(), DrawType::AtomicInitialize);
    assert!(init
        .shader
        .misc_flags
        .contains(ShaderMiscFlags::STORE_COLOR_CLEAR));

    // Preserved BGRA contents get swizzled, and an explicit batch isn't drawn twice.
    desc.color_load_action = LoadAction::PreserveRenderTarget;
    desc.render_target.preserved_contents_bgra = true;
    desc.draw_list
        .insert(0, DrawBatch::new(DrawType::AtomicInitialize, 1, 0));
    let recording = orchestrator.record_flush(&desc).unwrap();
    let inits = recording
        .iter()
        .filter(|command| matches!(command, Command::DrawAtomicInitialize))
        .count();
    assert_eq!(inits, 1);
    let misc_flags = draw_pipelines(&recording)[0].shader.misc_flags;
    assert!(misc_flags.contains(ShaderMiscFlags::SWIZZLE_COLOR_BGRA_TO_RGBA));
    assert!(!misc_flags.contains(ShaderMiscFlags::STORE_COLOR_CLEAR));
}

#[test]
fn advanced_blend_disables_fixed_function_output() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::Atomics);
    desc.combined_shader_features = ShaderFeatures::ADVANCED_BLEND;
    desc.draw_list
        .push(DrawBatch::new(DrawType::OuterCurvePatches, 1, 0));
    let recording = orchestrator.record_flush(&desc).unwrap();
    let pipelines = draw_pipelines(&recording);
    assert!(!pipelines[0]
        .shader
        .misc_flags
        .contains(ShaderMiscFlags::FIXED_FUNCTION_COLOR_OUTPUT));
}

#[test]
fn clockwise_fills_select_the_clockwise_shader() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.draw_list.push(
        DrawBatch::new(DrawType::MidpointFanPatches, 1, 0)
            .with_contents(DrawContents::CLOCKWISE_FILL),
    );
    let recording = orchestrator.record_flush(&desc).unwrap();
    assert!(draw_pipelines(&recording)[0]
        .shader
        .misc_flags
        .contains(ShaderMiscFlags::CLOCKWISE_FILL));
}

#[test]
fn instance_limits_split_render_passes() {
    let mut orchestrator = orchestrator(DriverWorkarounds {
        max_instances_per_render_pass: Some(4),
        ..Default::default()
    });
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.color_load_action = LoadAction::Clear;
    desc.draw_list
        .push(DrawBatch::new(DrawType::MidpointFanPatches, 10, 0));

    let recording = orchestrator.record_flush(&desc).unwrap();
    assert_eq!(
        summarize(&recording)[2..],
        [
            "Begin(Main)",
            "Bind",
            "Pipeline(MidpointFanPatches)",
            "Patches(4@0)",
            "End",
            "Resume(Main)",
            "Patches(4@4)",
            "End",
            "Resume(Main)",
            "Patches(2@8)",
            "End",
        ]
    );
    let loads: Vec<_> = recording.passes().map(|pass| pass.load).collect();
    assert_eq!(
        loads,
        [
            LoadAction::Clear,
            LoadAction::PreserveRenderTarget,
            LoadAction::PreserveRenderTarget
        ]
    );
}

#[test]
fn instance_limits_split_draws() {
    let mut orchestrator = orchestrator(DriverWorkarounds {
        max_instances_per_draw: Some(3),
        ..Default::default()
    });
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.tess_vertex_span_count = 4;
    desc.first_tess_vertex_span = 10;
    desc.draw_list
        .push(DrawBatch::new(DrawType::OuterCurvePatches, 7, 1));

    let summary = summarize(&orchestrator.record_flush(&desc).unwrap());
    assert!(summary.starts_with(&[
        "Ready(Gradient)".to_owned(),
        "Begin(Tessellation)".to_owned(),
        "Fixed(Tessellate)".to_owned(),
        "TessSpans(3)".to_owned(),
        "TessSpans(1)".to_owned(),
    ]));
    assert!(summary.ends_with(&[
        "Patches(3@1)".to_owned(),
        "Patches(3@4)".to_owned(),
        "Patches(1@7)".to_owned(),
        "End".to_owned(),
    ]));
}

#[test]
fn instance_ranges_may_end_at_the_last_index() {
    let mut orchestrator = orchestrator(DriverWorkarounds {
        max_instances_per_render_pass: Some(2),
        max_instances_per_draw: Some(2),
        ..Default::default()
    });
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.draw_list.push(DrawBatch::new(
        DrawType::MidpointFanPatches,
        3,
        u32::MAX - 2,
    ));

    let summary = summarize(&orchestrator.record_flush(&desc).unwrap());
    assert!(summary.ends_with(&[
        format!("Patches(2@{})", u32::MAX - 2),
        "End".to_owned(),
        "Resume(Main)".to_owned(),
        format!("Patches(1@{})", u32::MAX),
        "End".to_owned(),
    ]));
}

#[test]
fn offscreen_targets_are_copied_back() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.render_target.needs_offscreen = true;
    desc.render_target_update_bounds = IntRect::new(4, 4, 20, 12);
    desc.draw_list
        .push(DrawBatch::new(DrawType::OuterCurvePatches, 1, 0));

    let recording = orchestrator.record_flush(&desc).unwrap();
    assert!(recording.passes().last().unwrap().offscreen);
    assert!(matches!(
        recording.commands.last(),
        Some(Command::CopyOffscreenToTarget { bounds }) if *bounds == IntRect::new(4, 4, 20, 12)
    ));
}

#[test]
fn coalesced_resolve_skips_the_copy() {
    let mut orchestrator = orchestrator_with(
        MockBackend::new(),
        PlatformCapabilities {
            supports_fragment_shader_atomics: true,
            supports_coalesced_resolve_and_transfer: true,
            ..Default::default()
        },
        DriverWorkarounds::default(),
    );
    let mut desc = descriptor(InterlockMode::Atomics);
    desc.render_target.needs_offscreen = true;
    desc.draw_list
        .push(DrawBatch::new(DrawType::OuterCurvePatches, 1, 0));
    desc.draw_list
        .push(DrawBatch::new(DrawType::AtomicResolve, 1, 0));

    let recording = orchestrator.record_flush(&desc).unwrap();
    assert!(!recording
        .iter()
        .any(|command| matches!(command, Command::CopyOffscreenToTarget { .. })));
    let pipelines = draw_pipelines(&recording);
    let resolve = pipelines
        .iter()
        .find(|props| props.draw_type() == DrawType::AtomicResolve)
        .unwrap();
    assert!(resolve
        .shader
        .misc_flags
        .contains(ShaderMiscFlags::COALESCED_RESOLVE_AND_TRANSFER));
    assert!(!pipelines[0]
        .shader
        .misc_flags
        .contains(ShaderMiscFlags::COALESCED_RESOLVE_AND_TRANSFER));
}

#[test]
fn manual_msaa_resolve_follows_the_main_pass() {
    for manual in [false, true] {
        let mut orchestrator = orchestrator(DriverWorkarounds {
            manual_msaa_resolve: manual,
            ..Default::default()
        });
        let mut desc = descriptor(InterlockMode::Msaa);
        desc.draw_list
            .push(DrawBatch::new(DrawType::MidpointFanPatches, 1, 0));
        let summary = summarize(&orchestrator.record_flush(&desc).unwrap());
        assert_eq!(summary.last().unwrap() == "ResolveMsaa", manual);
    }
}

#[test]
fn wireframe_needs_device_support() {
    for supported in [false, true] {
        let mut orchestrator = orchestrator_with(
            MockBackend::new(),
            PlatformCapabilities {
                supports_wireframe: supported,
                ..Default::default()
            },
            DriverWorkarounds::default(),
        );
        let mut desc = descriptor(InterlockMode::Msaa);
        desc.wireframe = true;
        desc.draw_list
            .push(DrawBatch::new(DrawType::MidpointFanPatches, 1, 0));
        let recording = orchestrator.record_flush(&desc).unwrap();
        assert_eq!(draw_pipelines(&recording)[0].wireframe, supported);
    }
}

#[test]
fn images_carry_their_bindings() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.draw_list.push(DrawBatch {
        image_texture: Some(ImageTextureId(7)),
        image_draw_data_offset: 256,
        ..DrawBatch::new(DrawType::ImageRect, 1, 0)
    });
    let recording = orchestrator.record_flush(&desc).unwrap();
    assert!(recording.iter().any(|command| matches!(
        command,
        Command::DrawImageRect {
            texture: Some(ImageTextureId(7)),
            draw_data_offset: 256
        }
    )));
}

#[test]
fn textures_are_marked_ready_before_the_main_pass() {
    let mut orchestrator = orchestrator(DriverWorkarounds::default());
    let mut desc = descriptor(InterlockMode::RasterOrdering);
    desc.atlas_content_width = 8;
    desc.atlas_content_height = 8;
    desc.atlas_stroke_batches.push(AtlasBatch {
        scissor: IntRect::new(0, 0, 8, 8),
        base_patch: 0,
        patch_count: 1,
    });
    let recording = orchestrator.record_flush(&desc).unwrap();
    let position = |wanted: &dyn Fn(&Command<MockPipeline>) -> bool| {
        recording.iter().position(wanted).unwrap()
    };
    let main = position(&|command| {
        matches!(command, Command::BeginPass(desc) if desc.kind == PassKind::Main)
    });
    for kind in [
        TextureKind::Gradient,
        TextureKind::Tessellation,
        TextureKind::Atlas,
    ] {
        let ready = position(&|command| matches!(command, Command::TextureReady(k) if *k == kind));
        assert!(ready < main);
    }
}

#[test]
fn chunks_cover_the_whole_range() {
    let chunks: Vec<_> = InstanceChunker::with_limit(10, 100, Some(4)).collect();
    assert_eq!(chunks, [(4, 100), (4, 104), (2, 108)]);
    let total: u32 = chunks.iter().map(|(count, _)| count).sum();
    assert_eq!(total, 10);
    assert_eq!(
        InstanceChunker::with_limit(10, 0, None).collect::<Vec<_>>(),
        [(10, 0)]
    );
}
