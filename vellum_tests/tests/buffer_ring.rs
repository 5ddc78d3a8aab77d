// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Buffer rings across frames.

use vellum::{BufferRing, FlushBufferRings, FrameClock, PlatformCapabilities, RingKind};
use vellum_encoding::{
    FlushDescriptor, FlushUniforms, InterlockMode, RenderTargetInfo, TessVertexSpan,
    BUFFER_RING_SIZE, VERTEX_BUFFER_ALIGNMENT,
};
use vellum_tests::{FencedRingStorage, MockRingStorage, MockRingStorageFactory};

/// Maps and submits one slot per frame, with `frames_in_flight` frames the GPU hasn't
/// finished. Returns the slots that were reused too early.
fn write_frames(frames_in_flight: u64) -> Vec<(usize, u64)> {
    let clock = FrameClock::new();
    let mut ring = BufferRing::new(FencedRingStorage::new(clock.clone(), BUFFER_RING_SIZE), 64);
    for frame in 1..=20 {
        clock.begin_frame(frame, frame.saturating_sub(frames_in_flight));
        ring.map(16).unwrap().fill(frame as u8);
        ring.unmap_and_submit().unwrap();
    }
    assert_eq!(ring.storage().maps, 20);
    ring.storage().reused_in_flight.clone()
}

#[test]
fn slots_are_only_reused_once_their_frame_retires() {
    for frames_in_flight in 0..BUFFER_RING_SIZE as u64 {
        assert!(write_frames(frames_in_flight).is_empty());
    }
}

#[test]
fn too_many_frames_in_flight_reuse_busy_slots() {
    // The device layer must never get this far ahead of the GPU.
    let reused = write_frames(BUFFER_RING_SIZE as u64 + 1);
    assert_eq!(reused.first(), Some(&(0, 1)));
    assert_eq!(reused.len(), 20 - BUFFER_RING_SIZE);
}

#[test]
fn typed_writes_grow_rings_in_aligned_steps() {
    let factory = MockRingStorageFactory::default();
    let mut rings = FlushBufferRings::new(FrameClock::new());
    rings
        .reserve::<TessVertexSpan>(RingKind::TessSpans, 5, |_| Ok(factory.create()))
        .unwrap();
    assert_eq!(rings.capacity(RingKind::TessSpans), 512);
    // Already big enough.
    rings
        .reserve::<TessVertexSpan>(RingKind::TessSpans, 8, |_| unreachable!("fits"))
        .unwrap();
    rings
        .reserve::<TessVertexSpan>(RingKind::TessSpans, 9, |_| Ok(factory.create()))
        .unwrap();
    assert_eq!(rings.capacity(RingKind::TessSpans), 768);
    assert_eq!(768 % VERTEX_BUFFER_ALIGNMENT as usize, 0);

    rings
        .write(RingKind::TessSpans, &[TessVertexSpan::default(); 3])
        .unwrap();
    let ring = rings.ring(RingKind::TessSpans).unwrap();
    assert_eq!(ring.storage().uploads[0].1.len(), 3 * 64);
    assert!(rings.write(RingKind::Paint, &[0_u32]).is_err());
}

#[test]
fn flush_uniforms_fill_the_next_slot() {
    let factory = MockRingStorageFactory::default();
    let mut rings = FlushBufferRings::new(FrameClock::new());
    let desc = FlushDescriptor::new(
        RenderTargetInfo {
            width: 32,
            height: 16,
            ..Default::default()
        },
        InterlockMode::Msaa,
    );
    let caps = PlatformCapabilities {
        path_id_granularity: 4,
        ..Default::default()
    };
    for _ in 0..2 {
        rings
            .write_flush_uniforms(&desc, &caps, |_| Ok(factory.create()))
            .unwrap();
    }
    assert_eq!(factory.created(), 1);
    let uploads = &rings
        .ring(RingKind::FlushUniforms)
        .unwrap()
        .storage()
        .uploads;
    let slots: Vec<_> = uploads.iter().map(|(slot, _)| *slot).collect();
    assert_eq!(slots, [0, 1]);
    let expected = FlushUniforms::new(&desc, 4);
    assert_eq!(uploads[1].1, bytemuck::bytes_of(&expected));
}

#[test]
fn three_frames_write_three_slots() {
    let factory = MockRingStorage::factory();
    let mut ring = BufferRing::new(factory.create(), 16);
    for frame in 0_u8..4 {
        ring.map(4).unwrap().fill(frame);
        ring.unmap_and_submit().unwrap();
    }
    let slots: Vec<_> = ring.storage().uploads.iter().map(|(slot, _)| *slot).collect();
    assert_eq!(slots, [0, 1, 2, 0]);
    assert_eq!(ring.storage().uploads[3].1, [3; 4]);
    assert_eq!(ring.submitted_slot(), Some(0));
}

#[test]
fn growing_a_ring_keeps_the_old_storage_until_it_retires() {
    let factory = MockRingStorageFactory::default();
    let clock = FrameClock::new();
    let mut rings = FlushBufferRings::new(clock.clone());
    let create = |_| Ok(factory.create());

    rings.resize(RingKind::Contour, 256, create).unwrap();
    clock.begin_frame(10, 8);
    let ring = rings.ring_mut(RingKind::Contour).unwrap();
    ring.map(200).unwrap();
    ring.unmap_and_submit().unwrap();

    // Frame 10 may still be reading the 256 byte storage.
    rings.resize(RingKind::Contour, 1024, create).unwrap();
    assert_eq!(factory.live(), 2);
    assert_eq!(rings.capacity(RingKind::Contour), 1024);
    assert_eq!(rings.ring(RingKind::Contour).unwrap().storage().id, 1);

    for (current, safe) in [(11, 9), (12, 10), (13, 12)] {
        clock.begin_frame(current, safe);
        rings.on_new_frame_begun();
        assert_eq!(factory.live(), 2);
    }
    clock.begin_frame(14, 13);
    assert_eq!(rings.on_new_frame_begun(), 1);
    assert_eq!(factory.live(), 1);
    assert_eq!(factory.created(), 2);
}

#[test]
fn rings_are_independent() {
    let factory = MockRingStorageFactory::default();
    let mut rings = FlushBufferRings::new(FrameClock::new());
    for kind in RingKind::ALL {
        rings.resize(kind, 64, |_| Ok(factory.create())).unwrap();
    }
    assert_eq!(factory.live(), RingKind::ALL.len());

    rings
        .ring_mut(RingKind::FlushUniforms)
        .unwrap()
        .map(64)
        .unwrap();
    // A mapped ring can't be replaced, but the others can.
    assert!(rings
        .resize(RingKind::FlushUniforms, 128, |_| Ok(factory.create()))
        .is_err());
    rings
        .resize(RingKind::Paint, 128, |_| Ok(factory.create()))
        .unwrap();
    assert_eq!(rings.retired_storage_count(), 1);

    rings.shutdown();
    assert_eq!(factory.live(), 0);
    assert!(rings.ring(RingKind::Paint).is_none());
}
