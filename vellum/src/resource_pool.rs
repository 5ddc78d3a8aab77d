// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deferred reclamation of GPU resources.
//!
//! A resource released on the CPU may still be referenced by command buffers the GPU hasn't
//! finished yet. Instead of being destroyed, it becomes a "zombie" that expires
//! `ring_depth` frames after it was released, and can only be reused or destroyed once the
//! device reports that frame as safe.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vellum_encoding::BUFFER_RING_SIZE;

use crate::{lock, Result};

#[derive(Debug, Default)]
struct FrameCounters {
    current: AtomicU64,
    safe: AtomicU64,
}

/// The frame counters shared by every pool of a context.
///
/// `current_frame` is the index of the frame being recorded. Every command buffer submitted
/// in frames up to and including `safe_frame` has completed on the GPU.
#[derive(Clone, Debug, Default)]
pub struct FrameClock {
    counters: Arc<FrameCounters>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the device layer when it starts recording a frame.
    pub fn begin_frame(&self, current_frame: u64, safe_frame: u64) {
        debug_assert!(safe_frame <= current_frame);
        debug_assert!(current_frame >= self.current_frame());
        self.counters.current.store(current_frame, Ordering::Release);
        self.counters.safe.store(safe_frame, Ordering::Release);
    }

    pub fn current_frame(&self) -> u64 {
        self.counters.current.load(Ordering::Acquire)
    }

    pub fn safe_frame(&self) -> u64 {
        self.counters.safe.load(Ordering::Acquire)
    }
}

/// A resource that can be handed out again once the GPU is done with it.
pub trait Recycle {
    /// Prepares a recycled resource for its next user.
    fn reset(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourcePoolOptions {
    /// Number of frames a released resource may still be in use by the GPU.
    pub ring_depth: u64,
    /// Expired resources beyond this many are destroyed instead of kept for reuse.
    pub max_resources: usize,
}

impl Default for ResourcePoolOptions {
    fn default() -> Self {
        Self {
            ring_depth: BUFFER_RING_SIZE as u64,
            max_resources: 64,
        }
    }
}

struct Zombie<T> {
    resource: T,
    expiration: u64,
}

struct PoolShared<T> {
    clock: FrameClock,
    options: ResourcePoolOptions,
    /// Oldest first. Expirations never decrease from front to back.
    zombies: Mutex<VecDeque<Zombie<T>>>,
}

impl<T> PoolShared<T> {
    fn park(&self, resource: T) {
        let expiration = self.clock.current_frame() + self.options.ring_depth;
        let mut zombies = lock(&self.zombies);
        zombies.push_back(Zombie {
            resource,
            expiration,
        });
        Self::purge_excess(&mut zombies, self.options.max_resources, self.clock.safe_frame());
    }

    fn purge_excess(zombies: &mut VecDeque<Zombie<T>>, max_resources: usize, safe_frame: u64) {
        while zombies.len() > max_resources
            && zombies
                .front()
                .is_some_and(|zombie| zombie.expiration <= safe_frame)
        {
            zombies.pop_front();
        }
    }
}

/// Recycles resources of one kind, never reusing one the GPU may still be reading.
pub struct ResourcePool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Recycle> ResourcePool<T> {
    pub fn new(clock: FrameClock, options: ResourcePoolOptions) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                clock,
                options,
                zombies: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Hands out the oldest expired resource, or a new one from `create` if none has expired.
    pub fn acquire_with(&self, create: impl FnOnce() -> Result<T>) -> Result<Pooled<T>> {
        let safe_frame = self.shared.clock.safe_frame();
        let recycled = {
            let mut zombies = lock(&self.shared.zombies);
            if zombies
                .front()
                .is_some_and(|zombie| zombie.expiration <= safe_frame)
            {
                zombies.pop_front()
            } else {
                None
            }
        };
        let resource = match recycled {
            Some(mut zombie) => {
                zombie.resource.reset();
                zombie.resource
            }
            None => create()?,
        };
        Ok(Pooled {
            resource: Some(resource),
            pool: self.shared.clone(),
        })
    }

    /// Destroys expired resources while the pool holds more than its maximum.
    pub fn purge_excess(&self) {
        let mut zombies = lock(&self.shared.zombies);
        PoolShared::purge_excess(
            &mut zombies,
            self.shared.options.max_resources,
            self.shared.clock.safe_frame(),
        );
    }

    /// Number of released resources the pool holds.
    pub fn len(&self) -> usize {
        lock(&self.shared.zombies).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn options(&self) -> &ResourcePoolOptions {
        &self.shared.options
    }
}

/// A resource checked out of a [`ResourcePool`]. Dropping it returns it to the pool.
pub struct Pooled<T> {
    /// Only taken by `drop`.
    resource: Option<T>,
    pool: Arc<PoolShared<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource
            .as_ref()
            .expect("a pooled resource is only taken when dropped")
    }
}

impl<T> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource
            .as_mut()
            .expect("a pooled resource is only taken when dropped")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.park(resource);
        }
    }
}

/// Deferred destruction for resources owned by a context rather than a pool.
pub struct ZombiePurgatory<T> {
    clock: FrameClock,
    ring_depth: u64,
    zombies: VecDeque<Zombie<T>>,
    shut_down: bool,
}

impl<T> ZombiePurgatory<T> {
    pub fn new(clock: FrameClock, ring_depth: u64) -> Self {
        Self {
            clock,
            ring_depth,
            zombies: VecDeque::new(),
            shut_down: false,
        }
    }

    /// Keeps `resource` alive until the current frame has retired.
    pub fn park(&mut self, resource: T) {
        if self.shut_down {
            return;
        }
        self.zombies.push_back(Zombie {
            resource,
            expiration: self.clock.current_frame() + self.ring_depth,
        });
    }

    /// Destroys every resource whose frame has retired. Returns how many were destroyed.
    pub fn on_new_frame_begun(&mut self) -> usize {
        let safe_frame = self.clock.safe_frame();
        let mut destroyed = 0;
        while self
            .zombies
            .front()
            .is_some_and(|zombie| zombie.expiration <= safe_frame)
        {
            self.zombies.pop_front();
            destroyed += 1;
        }
        if destroyed > 0 {
            log::trace!("Destroyed {destroyed} retired resources");
        }
        destroyed
    }

    /// Destroys everything now. Resources parked later are destroyed immediately.
    ///
    /// Only call this once the device is idle.
    pub fn shutdown(&mut self) {
        self.zombies.clear();
        self.shut_down = true;
    }

    pub fn len(&self) -> usize {
        self.zombies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zombies.is_empty()
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }
}
