// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CPU-written GPU buffers, multi-buffered so that writing one frame's data never races the
//! GPU reading a previous frame's.

use bytemuck::Pod;
use vellum_encoding::{FlushDescriptor, FlushUniforms, BUFFER_RING_SIZE, VERTEX_BUFFER_ALIGNMENT};

use crate::resource_pool::{FrameClock, ZombiePurgatory};
use crate::{Error, PlatformCapabilities, Result};

/// The backing buffers of a [`BufferRing`], one per slot.
pub trait RingStorage {
    /// Maps `size` bytes of `slot` for writing, if the buffers support mapping. Returning
    /// `None` makes the ring write into a CPU shadow buffer and upload it with
    /// [`update_slot`](Self::update_slot) instead.
    fn map_slot(&mut self, slot: usize, size: usize) -> Option<&mut [u8]>;

    /// Flushes the bytes written through [`map_slot`](Self::map_slot).
    fn unmap_slot(&mut self, slot: usize, size: usize);

    /// Uploads `bytes` to the start of `slot`.
    fn update_slot(&mut self, slot: usize, bytes: &[u8]);
}

#[derive(Clone, Copy, Debug)]
struct Mapping {
    size: usize,
    shadowed: bool,
}

/// A ring of `slot_count` buffers of `capacity` bytes each.
///
/// Each [`map`](Self::map) moves on to the next slot. The caller guarantees that no more than
/// `slot_count - 1` frames are in flight, so the slot being mapped has always retired.
pub struct BufferRing<S> {
    storage: S,
    capacity: usize,
    slot_count: usize,
    current_slot: usize,
    submitted_slot: Option<usize>,
    mapping: Option<Mapping>,
    shadow: Vec<u8>,
}

impl<S: RingStorage> BufferRing<S> {
    pub fn new(storage: S, capacity: usize) -> Self {
        Self::with_slot_count(storage, capacity, BUFFER_RING_SIZE)
    }

    pub fn with_slot_count(storage: S, capacity: usize, slot_count: usize) -> Self {
        let slot_count = slot_count.max(1);
        Self {
            storage,
            capacity,
            slot_count,
            // The first map lands on slot 0.
            current_slot: slot_count - 1,
            submitted_slot: None,
            mapping: None,
            shadow: Vec::new(),
        }
    }

    /// Advances to the next slot and returns `size` writable bytes of it.
    pub fn map(&mut self, size: usize) -> Result<&mut [u8]> {
        if self.mapping.is_some() {
            return Err(Error::RingAlreadyMapped);
        }
        if size > self.capacity {
            return Err(Error::RingOverflow {
                requested: size,
                capacity: self.capacity,
            });
        }
        self.current_slot = (self.current_slot + 1) % self.slot_count;
        self.mapping = Some(Mapping {
            size,
            shadowed: false,
        });
        if let Some(bytes) = self.storage.map_slot(self.current_slot, size) {
            return Ok(bytes);
        }
        self.mapping = Some(Mapping {
            size,
            shadowed: true,
        });
        self.shadow.resize(size, 0);
        Ok(&mut self.shadow[..size])
    }

    /// Finishes writing the mapped slot and makes it the one draws read from.
    pub fn unmap_and_submit(&mut self) -> Result<()> {
        let mapping = self.mapping.take().ok_or(Error::RingNotMapped)?;
        if mapping.shadowed {
            self.storage
                .update_slot(self.current_slot, &self.shadow[..mapping.size]);
        } else {
            self.storage.unmap_slot(self.current_slot, mapping.size);
        }
        self.submitted_slot = Some(self.current_slot);
        Ok(())
    }

    /// The slot most recently submitted, which draws should bind.
    pub fn submitted_slot(&self) -> Option<usize> {
        self.submitted_slot
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Size of each slot in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

/// The transient buffers a flush writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RingKind {
    FlushUniforms,
    ImageDrawUniforms,
    Path,
    Paint,
    PaintAux,
    Contour,
    GradSpans,
    TessSpans,
    Triangles,
}

impl RingKind {
    pub const ALL: [Self; 9] = [
        Self::FlushUniforms,
        Self::ImageDrawUniforms,
        Self::Path,
        Self::Paint,
        Self::PaintAux,
        Self::Contour,
        Self::GradSpans,
        Self::TessSpans,
        Self::Triangles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::FlushUniforms => "flush_uniforms",
            Self::ImageDrawUniforms => "image_draw_uniforms",
            Self::Path => "path",
            Self::Paint => "paint",
            Self::PaintAux => "paint_aux",
            Self::Contour => "contour",
            Self::GradSpans => "grad_spans",
            Self::TessSpans => "tess_spans",
            Self::Triangles => "triangles",
        }
    }
}

/// One [`BufferRing`] per [`RingKind`], grown on demand.
///
/// Storage replaced by [`resize`](Self::resize) may still be read by frames in flight, so it
/// is kept alive until they retire.
pub struct FlushBufferRings<S> {
    rings: [Option<BufferRing<S>>; RingKind::ALL.len()],
    purgatory: ZombiePurgatory<S>,
}

impl<S: RingStorage> FlushBufferRings<S> {
    pub fn new(clock: FrameClock) -> Self {
        Self {
            rings: Default::default(),
            purgatory: ZombiePurgatory::new(clock, BUFFER_RING_SIZE as u64),
        }
    }

    /// Replaces the ring for `kind` with one of `capacity` bytes per slot, created by
    /// `create`. A capacity of 0 removes the ring. Does nothing if the capacity is unchanged.
    pub fn resize(
        &mut self,
        kind: RingKind,
        capacity: usize,
        create: impl FnOnce(usize) -> Result<S>,
    ) -> Result<()> {
        let ring = &mut self.rings[kind as usize];
        if ring.as_ref().map_or(0, BufferRing::capacity) == capacity {
            return Ok(());
        }
        if ring.as_ref().is_some_and(BufferRing::is_mapped) {
            return Err(Error::RingAlreadyMapped);
        }
        let new_ring = if capacity > 0 {
            Some(BufferRing::new(create(capacity)?, capacity))
        } else {
            None
        };
        log::debug!("Resizing {} ring to {capacity} bytes", kind.name());
        if let Some(old) = std::mem::replace(ring, new_ring) {
            self.purgatory.park(old.into_storage());
        }
        Ok(())
    }

    /// Grows the ring for `kind` until a slot holds `count` elements of `T`. Never shrinks it.
    pub fn reserve<T: Pod>(
        &mut self,
        kind: RingKind,
        count: usize,
        create: impl FnOnce(usize) -> Result<S>,
    ) -> Result<()> {
        let needed = (count.max(1) * size_of::<T>())
            .next_multiple_of(VERTEX_BUFFER_ALIGNMENT as usize);
        if self.capacity(kind) >= needed {
            return Ok(());
        }
        self.resize(kind, needed, create)
    }

    /// Writes `data` to the next slot of the ring for `kind` and submits it.
    pub fn write<T: Pod>(&mut self, kind: RingKind, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let Some(ring) = self.ring_mut(kind) else {
            return Err(Error::RingOverflow {
                requested: bytes.len(),
                capacity: 0,
            });
        };
        ring.map(bytes.len())?.copy_from_slice(bytes);
        ring.unmap_and_submit()
    }

    /// Fills the next flush uniform slot for `desc`.
    pub fn write_flush_uniforms(
        &mut self,
        desc: &FlushDescriptor,
        caps: &PlatformCapabilities,
        create: impl FnOnce(usize) -> Result<S>,
    ) -> Result<()> {
        self.reserve::<FlushUniforms>(RingKind::FlushUniforms, 1, create)?;
        let uniforms = FlushUniforms::new(desc, caps.path_id_granularity);
        self.write(RingKind::FlushUniforms, &[uniforms])
    }

    pub fn ring(&self, kind: RingKind) -> Option<&BufferRing<S>> {
        self.rings[kind as usize].as_ref()
    }

    pub fn ring_mut(&mut self, kind: RingKind) -> Option<&mut BufferRing<S>> {
        self.rings[kind as usize].as_mut()
    }

    pub fn capacity(&self, kind: RingKind) -> usize {
        self.ring(kind).map_or(0, BufferRing::capacity)
    }

    /// Destroys replaced storage whose last frame has retired.
    pub fn on_new_frame_begun(&mut self) -> usize {
        self.purgatory.on_new_frame_begun()
    }

    /// Number of replaced storages still waiting for their frame to retire.
    pub fn retired_storage_count(&self) -> usize {
        self.purgatory.len()
    }

    /// Drops every ring and parked storage. Only call this once the device is idle.
    pub fn shutdown(&mut self) {
        self.rings = Default::default();
        self.purgatory.shutdown();
    }
}
