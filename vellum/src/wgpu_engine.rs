// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The [`wgpu`] backend: pipeline creation, ring storage, and an engine that replays a
//! [`Recording`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Mutex;

use vellum_encoding::{
    gaussian_integral_table_f16, inverse_gaussian_integral_table_f16, DrawType, GradientSpan,
    ImageMeshId, ImageRectVertex, ImageTextureId, IntRect, InterlockMode, LoadAction,
    PatchBuffers, PatchVertex, ShaderFeatures, ShaderMiscFlags, ShaderProps, TessVertexSpan,
    GAUSSIAN_TABLE_SIZE, IMAGE_RECT_INDICES, IMAGE_RECT_VERTICES, TESS_SPAN_INDICES,
};
use wgpu::util::DeviceExt;
use wgpu::{
    Buffer, BufferUsages, Device, PipelineCompilationOptions, Queue, RenderPass, RenderPipeline,
    TextureFormat, TextureView,
};

use crate::recording::{Command, PassDesc, PassKind, Recording};
use crate::{
    lock, DriverWorkarounds, Error, FixedPipeline, PipelineBackend, PipelineProps,
    PipelineStatus, Result, RingStorage,
};

/// Format of the color ramp texture.
pub const GRADIENT_TEXTURE_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
/// Format of the tessellation texture.
pub const TESSELLATION_TEXTURE_FORMAT: TextureFormat = TextureFormat::Rgba32Uint;
/// Format of the coverage atlas.
pub const ATLAS_TEXTURE_FORMAT: TextureFormat = TextureFormat::R16Float;
/// Format of the feather texture: row 0 is the gaussian integral, row 1 its inverse.
pub const FEATHER_TEXTURE_FORMAT: TextureFormat = TextureFormat::R16Float;

const VERTEX_MAIN: &str = "vs_main";
const FRAGMENT_MAIN: &str = "fs_main";

/// WGSL sources for every family of shaders.
///
/// Each source must provide `vs_main` and `fs_main` entry points, and declare every override
/// constant in [`feature_constants`] as `override NAME: bool`.
#[derive(Clone, Debug, Default)]
pub struct ShaderSources {
    /// Patches, interior triangulations and atlas blits.
    pub paths: Option<Cow<'static, str>>,
    /// Image rects and image meshes.
    pub images: Option<Cow<'static, str>>,
    /// Atomic coverage initialization and resolve.
    pub atomic: Option<Cow<'static, str>>,
    pub stencil_clip_reset: Option<Cow<'static, str>>,
    pub color_ramp: Option<Cow<'static, str>>,
    pub tessellate: Option<Cow<'static, str>>,
    /// Atlas fills and strokes, which only differ in blending.
    pub atlas: Option<Cow<'static, str>>,
}

impl ShaderSources {
    fn draw_source(&self, draw_type: DrawType) -> Result<(&'static str, &str)> {
        let (name, source) = match draw_type {
            DrawType::MidpointFanPatches
            | DrawType::MidpointFanCenterAAPatches
            | DrawType::OuterCurvePatches
            | DrawType::InteriorTriangulation
            | DrawType::AtlasBlit => ("paths", &self.paths),
            DrawType::ImageRect | DrawType::ImageMesh => ("images", &self.images),
            DrawType::AtomicInitialize | DrawType::AtomicResolve => ("atomic", &self.atomic),
            DrawType::StencilClipReset => ("stencil_clip_reset", &self.stencil_clip_reset),
        };
        Ok((name, source.as_deref().ok_or(Error::MissingShaderSource(name))?))
    }

    fn fixed_source(&self, kind: FixedPipeline) -> Result<(&'static str, &str)> {
        let (name, source) = match kind {
            FixedPipeline::ColorRamp => ("color_ramp", &self.color_ramp),
            FixedPipeline::Tessellate => ("tessellate", &self.tessellate),
            FixedPipeline::AtlasFill | FixedPipeline::AtlasStroke => ("atlas", &self.atlas),
        };
        Ok((name, source.as_deref().ok_or(Error::MissingShaderSource(name))?))
    }
}

/// The pipeline-overridable constants that specialize a shader for `props`.
pub fn feature_constants(props: &ShaderProps) -> Vec<(&'static str, f64)> {
    let flag = |on: bool| if on { 1. } else { 0. };
    let features = props.features;
    let misc = props.misc_flags;
    vec![
        ("ENABLE_CLIPPING", flag(features.contains(ShaderFeatures::CLIPPING))),
        ("ENABLE_CLIP_RECT", flag(features.contains(ShaderFeatures::CLIP_RECT))),
        ("ENABLE_ADVANCED_BLEND", flag(features.contains(ShaderFeatures::ADVANCED_BLEND))),
        ("ENABLE_FEATHER", flag(features.contains(ShaderFeatures::FEATHER))),
        ("ENABLE_EVEN_ODD", flag(features.contains(ShaderFeatures::EVEN_ODD))),
        ("ENABLE_NESTED_CLIPPING", flag(features.contains(ShaderFeatures::NESTED_CLIPPING))),
        ("ENABLE_HSL_BLEND_MODES", flag(features.contains(ShaderFeatures::HSL_BLEND_MODES))),
        (
            "FIXED_FUNCTION_COLOR_OUTPUT",
            flag(misc.contains(ShaderMiscFlags::FIXED_FUNCTION_COLOR_OUTPUT)),
        ),
        ("CLOCKWISE_FILL", flag(misc.contains(ShaderMiscFlags::CLOCKWISE_FILL))),
        ("STORE_COLOR_CLEAR", flag(misc.contains(ShaderMiscFlags::STORE_COLOR_CLEAR))),
        (
            "SWIZZLE_COLOR_BGRA_TO_RGBA",
            flag(misc.contains(ShaderMiscFlags::SWIZZLE_COLOR_BGRA_TO_RGBA)),
        ),
        (
            "COALESCED_RESOLVE_AND_TRANSFER",
            flag(misc.contains(ShaderMiscFlags::COALESCED_RESOLVE_AND_TRANSFER)),
        ),
        (
            "DRAW_INTERIOR_TRIANGLES",
            flag(props.draw_type == DrawType::InteriorTriangulation),
        ),
        ("DRAW_IMAGE_MESH", flag(props.draw_type == DrawType::ImageMesh)),
        ("ATOMIC_INITIALIZE", flag(props.draw_type == DrawType::AtomicInitialize)),
        ("ATOMIC_RESOLVE", flag(props.draw_type == DrawType::AtomicResolve)),
    ]
}

/// A compiled shader module and the constants that specialize it.
pub struct WgpuShader {
    module: wgpu::ShaderModule,
    constants: Vec<(&'static str, f64)>,
}

#[derive(Debug)]
pub struct WgpuPipeline {
    pub pipeline: RenderPipeline,
    pub label: String,
}

const PATCH_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x4, 1 => Float32x4];
const TRIANGLE_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Sint32];
const IMAGE_RECT_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    wgpu::vertex_attr_array![0 => Float32x4];
const IMAGE_MESH_POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    wgpu::vertex_attr_array![0 => Float32x2];
const IMAGE_MESH_UV_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    wgpu::vertex_attr_array![1 => Float32x2];
const GRADIENT_SPAN_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    wgpu::vertex_attr_array![0 => Uint32x4];
const TESS_SPAN_ATTRIBUTES: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
    0 => Float32x4, 1 => Float32x4, 2 => Float32x4, 3 => Uint32x4
];

fn vertex_layout(
    stride: usize,
    step_mode: wgpu::VertexStepMode,
    attributes: &'static [wgpu::VertexAttribute],
) -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: stride as u64,
        step_mode,
        attributes,
    }
}

fn draw_vertex_layouts(draw_type: DrawType) -> Vec<wgpu::VertexBufferLayout<'static>> {
    use wgpu::VertexStepMode::Vertex;
    match draw_type {
        DrawType::MidpointFanPatches
        | DrawType::MidpointFanCenterAAPatches
        | DrawType::OuterCurvePatches => {
            vec![vertex_layout(size_of::<PatchVertex>(), Vertex, &PATCH_ATTRIBUTES)]
        }
        DrawType::InteriorTriangulation | DrawType::AtlasBlit | DrawType::StencilClipReset => {
            vec![vertex_layout(12, Vertex, &TRIANGLE_ATTRIBUTES)]
        }
        DrawType::ImageRect => vec![vertex_layout(
            size_of::<ImageRectVertex>(),
            Vertex,
            &IMAGE_RECT_ATTRIBUTES,
        )],
        DrawType::ImageMesh => vec![
            vertex_layout(8, Vertex, &IMAGE_MESH_POSITION_ATTRIBUTES),
            vertex_layout(8, Vertex, &IMAGE_MESH_UV_ATTRIBUTES),
        ],
        DrawType::AtomicInitialize | DrawType::AtomicResolve => vec![],
    }
}

/// Builds pipelines with a [`Device`] from caller-supplied WGSL.
///
/// All draw pipelines share one pipeline layout, whose group 0 is the flush bind group and
/// whose group 1 is the per-image bind group (with a dynamic uniform offset).
pub struct WgpuBackend {
    device: Device,
    sources: ShaderSources,
    layout: wgpu::PipelineLayout,
    target_format: TextureFormat,
    msaa_sample_count: u32,
    pipeline_cache: Option<wgpu::PipelineCache>,
    /// Error scopes are a stack on the device, so only one thread may use one at a time.
    error_scope: Mutex<()>,
}

impl WgpuBackend {
    pub fn new(
        device: Device,
        sources: ShaderSources,
        layout: wgpu::PipelineLayout,
        target_format: TextureFormat,
    ) -> Self {
        Self {
            device,
            sources,
            layout,
            target_format,
            msaa_sample_count: 4,
            pipeline_cache: None,
            error_scope: Mutex::new(()),
        }
    }

    pub fn with_msaa_sample_count(mut self, sample_count: u32) -> Self {
        self.msaa_sample_count = sample_count;
        self
    }

    pub fn with_pipeline_cache(mut self, cache: wgpu::PipelineCache) -> Self {
        self.pipeline_cache = Some(cache);
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn with_error_scope<T>(&self, create: impl FnOnce() -> T) -> Result<T> {
        let _guard = lock(&self.error_scope);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.into()),
            None => Ok(value),
        }
    }

    fn create_module(&self, label: &str, source: &str) -> Result<wgpu::ShaderModule> {
        self.with_error_scope(|| {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_owned())),
                })
        })
    }

    fn create_shader(&self, props: &ShaderProps) -> Result<WgpuShader> {
        let (name, source) = self.sources.draw_source(props.draw_type)?;
        let module = self.create_module(name, source)?;
        Ok(WgpuShader {
            module,
            constants: feature_constants(props),
        })
    }

    #[expect(clippy::too_many_arguments, reason = "Mirrors the descriptor it fills in")]
    fn create_render_pipeline(
        &self,
        label: &str,
        vertex: (&wgpu::ShaderModule, &[(&str, f64)]),
        fragment: (&wgpu::ShaderModule, &[(&str, f64)]),
        buffers: &[wgpu::VertexBufferLayout<'_>],
        topology: wgpu::PrimitiveTopology,
        polygon_mode: wgpu::PolygonMode,
        target: wgpu::ColorTargetState,
        sample_count: u32,
    ) -> Result<RenderPipeline> {
        self.with_error_scope(|| {
            self.device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(label),
                    layout: Some(&self.layout),
                    vertex: wgpu::VertexState {
                        module: vertex.0,
                        entry_point: Some(VERTEX_MAIN),
                        buffers,
                        compilation_options: PipelineCompilationOptions {
                            constants: vertex.1,
                            ..Default::default()
                        },
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: fragment.0,
                        entry_point: Some(FRAGMENT_MAIN),
                        targets: &[Some(target)],
                        compilation_options: PipelineCompilationOptions {
                            constants: fragment.1,
                            ..Default::default()
                        },
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology,
                        polygon_mode,
                        ..Default::default()
                    },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState {
                        count: sample_count,
                        ..Default::default()
                    },
                    multiview: None,
                    cache: self.pipeline_cache.as_ref(),
                })
        })
    }
}

impl PipelineBackend for WgpuBackend {
    type VertexShader = WgpuShader;
    type FragmentShader = WgpuShader;
    type Pipeline = WgpuPipeline;

    fn create_vertex_shader(&self, props: &ShaderProps) -> Result<WgpuShader> {
        self.create_shader(props)
    }

    fn create_fragment_shader(&self, props: &ShaderProps) -> Result<WgpuShader> {
        self.create_shader(props)
    }

    fn create_pipeline(
        &self,
        props: &PipelineProps,
        vertex: &WgpuShader,
        fragment: &WgpuShader,
    ) -> Result<WgpuPipeline> {
        let shader = &props.shader;
        let label = format!("vellum_{:?}_{:x}", shader.draw_type, props.key().0);
        let topology = if matches!(
            shader.draw_type,
            DrawType::AtomicInitialize | DrawType::AtomicResolve
        ) {
            wgpu::PrimitiveTopology::TriangleStrip
        } else {
            wgpu::PrimitiveTopology::TriangleList
        };
        let polygon_mode = if props.wireframe {
            wgpu::PolygonMode::Line
        } else {
            wgpu::PolygonMode::Fill
        };
        // Without fixed function color output, the shader blends itself.
        let blend = (shader.interlock_mode == InterlockMode::Msaa
            || shader
                .misc_flags
                .contains(ShaderMiscFlags::FIXED_FUNCTION_COLOR_OUTPUT))
        .then_some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING);
        let sample_count = if shader.interlock_mode == InterlockMode::Msaa {
            self.msaa_sample_count
        } else {
            1
        };
        let pipeline = self.create_render_pipeline(
            &label,
            (&vertex.module, &vertex.constants),
            (&fragment.module, &fragment.constants),
            &draw_vertex_layouts(shader.draw_type),
            topology,
            polygon_mode,
            wgpu::ColorTargetState {
                format: self.target_format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            },
            sample_count,
        )?;
        Ok(WgpuPipeline { pipeline, label })
    }

    fn create_fixed_pipeline(&self, kind: FixedPipeline) -> Result<WgpuPipeline> {
        use wgpu::VertexStepMode::{Instance, Vertex};
        let (name, source) = self.sources.fixed_source(kind)?;
        let module = self.create_module(name, source)?;
        let (buffers, topology, format, blend) = match kind {
            FixedPipeline::ColorRamp => (
                vec![vertex_layout(
                    size_of::<GradientSpan>(),
                    Instance,
                    &GRADIENT_SPAN_ATTRIBUTES,
                )],
                wgpu::PrimitiveTopology::TriangleStrip,
                GRADIENT_TEXTURE_FORMAT,
                None,
            ),
            FixedPipeline::Tessellate => (
                vec![vertex_layout(
                    size_of::<TessVertexSpan>(),
                    Instance,
                    &TESS_SPAN_ATTRIBUTES,
                )],
                wgpu::PrimitiveTopology::TriangleList,
                TESSELLATION_TEXTURE_FORMAT,
                None,
            ),
            FixedPipeline::AtlasFill | FixedPipeline::AtlasStroke => {
                let operation = if kind == FixedPipeline::AtlasFill {
                    wgpu::BlendOperation::Add
                } else {
                    wgpu::BlendOperation::Max
                };
                let component = wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation,
                };
                (
                    vec![vertex_layout(
                        size_of::<PatchVertex>(),
                        Vertex,
                        &PATCH_ATTRIBUTES,
                    )],
                    wgpu::PrimitiveTopology::TriangleList,
                    ATLAS_TEXTURE_FORMAT,
                    Some(wgpu::BlendState {
                        color: component,
                        alpha: component,
                    }),
                )
            }
        };
        let label = format!("vellum_{kind:?}");
        let pipeline = self.create_render_pipeline(
            &label,
            (&module, &[]),
            (&module, &[]),
            &buffers,
            topology,
            wgpu::PolygonMode::Fill,
            wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            },
            1,
        )?;
        Ok(WgpuPipeline { pipeline, label })
    }

    fn pipeline_status(&self, _: &WgpuPipeline) -> PipelineStatus {
        // Creation is synchronous, and failures are reported by `create_pipeline`.
        PipelineStatus::Ready
    }
}

/// Ring storage for wgpu buffers, which can't stay mapped, so every slot is written with
/// [`Queue::write_buffer`].
pub struct WgpuRingStorage {
    queue: Queue,
    buffers: Vec<Buffer>,
}

impl WgpuRingStorage {
    pub fn new(
        device: &Device,
        queue: &Queue,
        label: &str,
        usage: BufferUsages,
        capacity: usize,
        slot_count: usize,
    ) -> Self {
        let size = wgpu::util::align_to(capacity.max(1) as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        let buffers = (0..slot_count.max(1))
            .map(|slot| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("{label}[{slot}]")),
                    size,
                    usage: usage | BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();
        Self {
            queue: queue.clone(),
            buffers,
        }
    }

    pub fn buffer(&self, slot: usize) -> Option<&Buffer> {
        self.buffers.get(slot)
    }
}

impl RingStorage for WgpuRingStorage {
    fn map_slot(&mut self, _: usize, _: usize) -> Option<&mut [u8]> {
        None
    }

    fn unmap_slot(&mut self, _: usize, _: usize) {}

    fn update_slot(&mut self, slot: usize, bytes: &[u8]) {
        let Some(buffer) = self.buffers.get(slot) else {
            log::error!("Ring slot {slot} is out of range");
            return;
        };
        let alignment = wgpu::COPY_BUFFER_ALIGNMENT as usize;
        if bytes.len() % alignment == 0 {
            self.queue.write_buffer(buffer, 0, bytes);
        } else {
            let mut padded = bytes.to_vec();
            padded.resize(bytes.len().next_multiple_of(alignment), 0);
            self.queue.write_buffer(buffer, 0, &padded);
        }
    }
}

/// Buffers an image mesh draws from.
pub struct ImageMeshBuffers {
    pub positions: Buffer,
    pub uvs: Buffer,
    pub indices: Buffer,
}

/// The resources a [`Recording`] is replayed against.
pub struct FlushTargets<'a> {
    pub gradient: &'a TextureView,
    pub tessellation: &'a TextureView,
    pub atlas: &'a TextureView,
    /// The render target.
    pub target: &'a TextureView,
    pub target_texture: &'a wgpu::Texture,
    /// Color texture used when the target can't be rendered to directly.
    pub offscreen: Option<(&'a TextureView, &'a wgpu::Texture)>,
    /// Multisampled color texture for `Msaa` interlock mode.
    pub msaa_color: Option<&'a TextureView>,
    pub flush_bind_group: &'a wgpu::BindGroup,
    pub grad_spans: Option<&'a Buffer>,
    pub tess_spans: Option<&'a Buffer>,
    pub triangles: Option<&'a Buffer>,
    pub images: &'a HashMap<ImageTextureId, wgpu::BindGroup>,
    pub meshes: &'a HashMap<ImageMeshId, ImageMeshBuffers>,
}

impl FlushTargets<'_> {
    fn main_color(&self, desc: &PassDesc) -> &TextureView {
        match self.offscreen {
            Some((view, _)) if desc.offscreen => view,
            _ => self.target,
        }
    }
}

/// Geometry every flush draws from.
struct StaticBuffers {
    patch_vertices: Buffer,
    patch_indices: Buffer,
    tess_span_indices: Buffer,
    image_rect_vertices: Buffer,
    image_rect_indices: Buffer,
}

impl StaticBuffers {
    fn new(device: &Device) -> Self {
        let init = |label: &str, contents: &[u8], usage: BufferUsages| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            })
        };
        let patches = PatchBuffers::get();
        Self {
            patch_vertices: init(
                "vellum.patch_vertices",
                patches.vertex_bytes(),
                BufferUsages::VERTEX,
            ),
            patch_indices: init(
                "vellum.patch_indices",
                patches.index_bytes(),
                BufferUsages::INDEX,
            ),
            tess_span_indices: init(
                "vellum.tess_span_indices",
                bytemuck::cast_slice(&TESS_SPAN_INDICES),
                BufferUsages::INDEX,
            ),
            image_rect_vertices: init(
                "vellum.image_rect_vertices",
                bytemuck::cast_slice(&IMAGE_RECT_VERTICES),
                BufferUsages::VERTEX,
            ),
            image_rect_indices: init(
                "vellum.image_rect_indices",
                bytemuck::cast_slice(&IMAGE_RECT_INDICES),
                BufferUsages::INDEX,
            ),
        }
    }
}

/// Replays recordings into wgpu command buffers.
pub struct WgpuEngine {
    statics: StaticBuffers,
    workarounds: DriverWorkarounds,
}

/// Draw state restored when a pass is split.
#[derive(Default)]
struct BoundState<'r> {
    pipeline: Option<&'r RenderPipeline>,
    flush_resources: bool,
    scissor: Option<IntRect>,
}

impl WgpuEngine {
    pub fn new(device: &Device, workarounds: DriverWorkarounds) -> Self {
        Self {
            statics: StaticBuffers::new(device),
            workarounds,
        }
    }

    /// Creates the feather lookup texture: the gaussian integral in row 0 and its inverse in
    /// row 1, as half floats.
    pub fn create_feather_texture(device: &Device, queue: &Queue) -> wgpu::Texture {
        let size = wgpu::Extent3d {
            width: GAUSSIAN_TABLE_SIZE as u32,
            height: 2,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("vellum.feather"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FEATHER_TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let mut texels = Vec::with_capacity(GAUSSIAN_TABLE_SIZE * 2);
        texels.extend_from_slice(gaussian_integral_table_f16());
        texels.extend_from_slice(inverse_gaussian_integral_table_f16());
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(GAUSSIAN_TABLE_SIZE as u32 * 2),
                rows_per_image: None,
            },
            size,
        );
        texture
    }

    /// Encodes `recording` and submits it to `queue`.
    pub fn run_recording(
        &self,
        device: &Device,
        queue: &Queue,
        recording: &Recording<WgpuPipeline>,
        targets: &FlushTargets<'_>,
    ) -> Result<()> {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("vellum.flush"),
        });
        let mut pass: Option<RenderPass<'static>> = None;
        let mut pass_desc: Option<PassDesc> = None;
        let mut bound = BoundState::default();
        for command in recording {
            match command {
                Command::BeginPass(desc) => {
                    if !desc.resume {
                        bound = BoundState::default();
                    }
                    let mut new_pass = self.begin_pass(&mut encoder, desc, targets);
                    if desc.resume {
                        self.restore(&mut new_pass, &bound, targets);
                    }
                    pass = Some(new_pass);
                    pass_desc = Some(*desc);
                }
                Command::EndPass => {
                    pass = None;
                }
                Command::Barrier(barriers) => {
                    // wgpu has no barriers inside a pass; splitting the pass synchronizes
                    // with everything drawn so far.
                    if let (Some(desc), true) = (pass_desc, pass.is_some()) {
                        log::trace!("Splitting render pass for {barriers:?}");
                        drop(pass.take());
                        let desc = PassDesc {
                            load: LoadAction::PreserveRenderTarget,
                            resume: true,
                            ..desc
                        };
                        let mut new_pass = self.begin_pass(&mut encoder, &desc, targets);
                        self.restore(&mut new_pass, &bound, targets);
                        pass = Some(new_pass);
                    }
                }
                Command::TextureReady(_) => {
                    // wgpu inserts the transitions between passes itself.
                }
                Command::ResolveMsaa => {
                    drop(pass.take());
                    if let (Some(msaa), Some(desc)) = (targets.msaa_color, pass_desc) {
                        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                            label: Some("vellum.msaa_resolve"),
                            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                                view: msaa,
                                depth_slice: None,
                                resolve_target: Some(targets.main_color(&desc)),
                                ops: wgpu::Operations {
                                    load: wgpu::LoadOp::Load,
                                    store: wgpu::StoreOp::Discard,
                                },
                            })],
                            depth_stencil_attachment: None,
                            timestamp_writes: None,
                            occlusion_query_set: None,
                        });
                    }
                }
                Command::CopyOffscreenToTarget { bounds } => {
                    drop(pass.take());
                    if let Some((_, offscreen)) = targets.offscreen {
                        copy_bounds(&mut encoder, offscreen, targets.target_texture, *bounds);
                    }
                }
                command => {
                    let Some(pass) = pass.as_mut() else {
                        log::warn!("Ignoring {command:?} outside of a render pass");
                        continue;
                    };
                    self.encode_draw(pass, command, &mut bound, targets);
                }
            }
        }
        drop(pass);
        queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn begin_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        desc: &PassDesc,
        targets: &FlushTargets<'_>,
    ) -> RenderPass<'static> {
        let (label, view) = match desc.kind {
            PassKind::Gradient => ("vellum.gradient", targets.gradient),
            PassKind::Tessellation => ("vellum.tessellation", targets.tessellation),
            PassKind::Atlas => ("vellum.atlas", targets.atlas),
            PassKind::Main => ("vellum.main", targets.main_color(desc)),
        };
        let (view, resolve_target) = match (desc.kind, targets.msaa_color) {
            (PassKind::Main, Some(msaa)) if !self.workarounds.manual_msaa_resolve => {
                (msaa, Some(view))
            }
            (PassKind::Main, Some(msaa)) => (msaa, None),
            _ => (view, None),
        };
        let load = match desc.load {
            LoadAction::Clear => wgpu::LoadOp::Clear(unpack_color(desc.clear_color)),
            LoadAction::PreserveRenderTarget | LoadAction::DontCare => wgpu::LoadOp::Load,
        };
        encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            })
            .forget_lifetime()
    }

    fn restore(
        &self,
        pass: &mut RenderPass<'static>,
        bound: &BoundState<'_>,
        targets: &FlushTargets<'_>,
    ) {
        if let Some(pipeline) = bound.pipeline {
            pass.set_pipeline(pipeline);
        }
        if bound.flush_resources {
            pass.set_bind_group(0, targets.flush_bind_group, &[]);
        }
        if let Some(scissor) = bound.scissor {
            set_scissor(pass, scissor);
        }
    }

    fn encode_draw<'r>(
        &self,
        pass: &mut RenderPass<'static>,
        command: &'r Command<WgpuPipeline>,
        bound: &mut BoundState<'r>,
        targets: &FlushTargets<'_>,
    ) {
        let statics = &self.statics;
        match command {
            Command::SetPipeline(pipeline) => {
                pass.set_pipeline(&pipeline.pipeline);
                bound.pipeline = Some(&pipeline.pipeline);
            }
            Command::BindFlushResources => {
                pass.set_bind_group(0, targets.flush_bind_group, &[]);
                bound.flush_resources = true;
            }
            Command::SetScissor(scissor) => {
                set_scissor(pass, *scissor);
                bound.scissor = Some(*scissor);
            }
            Command::DrawGradientSpans {
                instance_count,
                base_instance,
            } => {
                let Some(spans) = targets.grad_spans else {
                    log::warn!("No gradient span buffer bound");
                    return;
                };
                pass.set_vertex_buffer(0, spans.slice(..));
                pass.draw(0..4, *base_instance..base_instance + instance_count);
            }
            Command::DrawTessellationSpans {
                instance_count,
                base_instance,
            } => {
                let Some(spans) = targets.tess_spans else {
                    log::warn!("No tessellation span buffer bound");
                    return;
                };
                pass.set_vertex_buffer(0, spans.slice(..));
                pass.set_index_buffer(
                    statics.tess_span_indices.slice(..),
                    wgpu::IndexFormat::Uint16,
                );
                pass.draw_indexed(
                    0..TESS_SPAN_INDICES.len() as u32,
                    0,
                    *base_instance..base_instance + instance_count,
                );
            }
            Command::DrawPatches {
                index_count,
                base_index,
                instance_count,
                base_instance,
                ..
            } => {
                pass.set_vertex_buffer(0, statics.patch_vertices.slice(..));
                pass.set_index_buffer(statics.patch_indices.slice(..), wgpu::IndexFormat::Uint16);
                pass.draw_indexed(
                    *base_index..base_index + index_count,
                    0,
                    *base_instance..base_instance + instance_count,
                );
            }
            Command::DrawTriangles {
                vertex_count,
                base_vertex,
            } => {
                let Some(triangles) = targets.triangles else {
                    log::warn!("No triangle buffer bound");
                    return;
                };
                pass.set_vertex_buffer(0, triangles.slice(..));
                pass.draw(*base_vertex..base_vertex + vertex_count, 0..1);
            }
            Command::DrawImageRect {
                texture,
                draw_data_offset,
            } => {
                let Some(images) = texture.and_then(|id| targets.images.get(&id)) else {
                    log::warn!("Image rect without a bound image");
                    return;
                };
                pass.set_bind_group(1, images, &[*draw_data_offset]);
                pass.set_vertex_buffer(0, statics.image_rect_vertices.slice(..));
                pass.set_index_buffer(
                    statics.image_rect_indices.slice(..),
                    wgpu::IndexFormat::Uint16,
                );
                pass.draw_indexed(0..IMAGE_RECT_INDICES.len() as u32, 0, 0..1);
            }
            Command::DrawImageMesh {
                texture,
                mesh,
                index_count,
                draw_data_offset,
            } => {
                let images = texture.and_then(|id| targets.images.get(&id));
                let mesh = mesh.and_then(|id| targets.meshes.get(&id));
                let (Some(images), Some(mesh)) = (images, mesh) else {
                    log::warn!("Image mesh without a bound image or mesh");
                    return;
                };
                pass.set_bind_group(1, images, &[*draw_data_offset]);
                pass.set_vertex_buffer(0, mesh.positions.slice(..));
                pass.set_vertex_buffer(1, mesh.uvs.slice(..));
                pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint16);
                pass.draw_indexed(0..*index_count, 0, 0..1);
            }
            Command::DrawAtomicInitialize | Command::DrawResolve => {
                pass.draw(0..4, 0..1);
            }
            Command::BeginPass(_)
            | Command::EndPass
            | Command::Barrier(_)
            | Command::TextureReady(_)
            | Command::ResolveMsaa
            | Command::CopyOffscreenToTarget { .. } => {}
        }
    }
}

fn set_scissor(pass: &mut RenderPass<'static>, scissor: IntRect) {
    let left = scissor.left.max(0) as u32;
    let top = scissor.top.max(0) as u32;
    let width = scissor.width().max(0) as u32;
    let height = scissor.height().max(0) as u32;
    pass.set_scissor_rect(left, top, width, height);
}

fn copy_bounds(
    encoder: &mut wgpu::CommandEncoder,
    source: &wgpu::Texture,
    destination: &wgpu::Texture,
    bounds: IntRect,
) {
    let size = source.size();
    let bounds = bounds.intersect(&IntRect::from_size(size.width, size.height));
    if bounds.is_empty() {
        return;
    }
    let origin = wgpu::Origin3d {
        x: bounds.left as u32,
        y: bounds.top as u32,
        z: 0,
    };
    encoder.copy_texture_to_texture(
        wgpu::TexelCopyTextureInfo {
            texture: source,
            mip_level: 0,
            origin,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyTextureInfo {
            texture: destination,
            mip_level: 0,
            origin,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::Extent3d {
            width: bounds.width() as u32,
            height: bounds.height() as u32,
            depth_or_array_layers: 1,
        },
    );
}

/// Unpacks premultiplied RGBA8, red in the low byte.
fn unpack_color(rgba: u32) -> wgpu::Color {
    let channel = |shift: u32| f64::from((rgba >> shift) & 0xff) / 255.;
    wgpu::Color {
        r: channel(0),
        g: channel(8),
        b: channel(16),
        a: channel(24),
    }
}
