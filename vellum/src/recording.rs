// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use vellum_encoding::{BarrierFlags, DrawType, ImageMeshId, ImageTextureId, IntRect, LoadAction};

/// The render passes of a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Renders color ramps into the gradient texture.
    Gradient,
    /// Renders tessellated vertices into the tessellation texture.
    Tessellation,
    /// Renders feathered coverage into the atlas.
    Atlas,
    /// Renders the draw list into the render target.
    Main,
}

/// Textures a pass produces and later passes read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Gradient,
    Tessellation,
    Atlas,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassDesc {
    pub kind: PassKind,
    pub load: LoadAction,
    pub width: u32,
    pub height: u32,
    /// Premultiplied RGBA8, used when `load` is [`LoadAction::Clear`].
    pub clear_color: u32,
    pub coverage_clear_value: u32,
    /// Draw into the offscreen color texture instead of the render target.
    pub offscreen: bool,
    /// This pass continues one that was interrupted, so its pipeline must be rebound.
    pub resume: bool,
}

impl PassDesc {
    /// A pass that starts from cleared (zeroed) contents.
    pub fn cleared(kind: PassKind, width: u32, height: u32) -> Self {
        Self {
            kind,
            load: LoadAction::Clear,
            width,
            height,
            clear_color: 0,
            coverage_clear_value: 0,
            offscreen: false,
            resume: false,
        }
    }
}

/// Single command inside a [`Recording`] to get executed by an engine.
#[derive(Debug)]
pub enum Command<P> {
    BeginPass(PassDesc),
    SetPipeline(Arc<P>),
    SetScissor(IntRect),
    /// Instanced 4-vertex strips, one per gradient span.
    DrawGradientSpans {
        instance_count: u32,
        base_instance: u32,
    },
    /// Instanced 12-index span geometry, one instance per tessellation span.
    DrawTessellationSpans {
        instance_count: u32,
        base_instance: u32,
    },
    /// Instanced patches out of the shared patch buffers.
    DrawPatches {
        draw_type: DrawType,
        index_count: u32,
        base_index: u32,
        instance_count: u32,
        base_instance: u32,
    },
    /// Non-indexed triangles out of the triangle ring.
    DrawTriangles {
        vertex_count: u32,
        base_vertex: u32,
    },
    DrawImageRect {
        texture: Option<ImageTextureId>,
        draw_data_offset: u32,
    },
    DrawImageMesh {
        texture: Option<ImageTextureId>,
        mesh: Option<ImageMeshId>,
        index_count: u32,
        draw_data_offset: u32,
    },
    /// Full-screen 4-vertex strip initializing atomic coverage, for devices whose load ops
    /// can't.
    DrawAtomicInitialize,
    /// Full-screen 4-vertex strip resolving atomic coverage.
    DrawResolve,
    /// Synchronizes with previous draws of the same pass.
    Barrier(BarrierFlags),
    /// A texture produced by an earlier pass is now readable.
    TextureReady(TextureKind),
    /// Binds the flush-wide uniforms, storage buffers and textures of the main pass.
    BindFlushResources,
    EndPass,
    /// Resolves multisampled color with a draw.
    ResolveMsaa,
    CopyOffscreenToTarget {
        bounds: IntRect,
    },
}

/// List of [`Command`]s for an engine to execute in order.
#[derive(Debug)]
pub struct Recording<P> {
    pub commands: Vec<Command<P>>,
}

impl<P> Default for Recording<P> {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
        }
    }
}

impl<P> Recording<P> {
    pub fn push(&mut self, command: Command<P>) {
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command<P>> {
        self.commands.iter()
    }

    /// The passes begun, in order.
    pub fn passes(&self) -> impl Iterator<Item = &PassDesc> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::BeginPass(desc) => Some(desc),
            _ => None,
        })
    }
}

impl<'a, P> IntoIterator for &'a Recording<P> {
    type Item = &'a Command<P>;
    type IntoIter = std::slice::Iter<'a, Command<P>>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}
