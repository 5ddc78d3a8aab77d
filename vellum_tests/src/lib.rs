// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Vellum tests.
//!
//! These run against [`MockBackend`] and [`MockRingStorage`], which record what they were
//! asked to do instead of talking to a GPU.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
// Feel free to send a PR that solves one or more of these.
#![allow(
    missing_debug_implementations,
    unreachable_pub,
    missing_docs,
    clippy::missing_assert_message,
    reason = "Deferred"
)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use vellum::{
    AsyncPipelineManager, Error, FixedPipeline, FrameClock, PipelineBackend, PipelineKey, PipelineProps,
    PipelineStatus, RingStorage,
};
use vellum_encoding::{
    DrawType, InterlockMode, ShaderFeatures, ShaderKey, ShaderMiscFlags, ShaderProps,
    VertexShaderKey,
};

type MockResult<T> = std::result::Result<T, Error>;

/// Sets up logging for a test. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// What a [`MockBackend`] hands out as a pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum MockPipeline {
    Draw(PipelineProps),
    Fixed(FixedPipeline),
}

impl MockPipeline {
    pub fn key(&self) -> Option<PipelineKey> {
        match self {
            Self::Draw(props) => Some(props.key()),
            Self::Fixed(_) => None,
        }
    }

    pub fn props(&self) -> Option<&PipelineProps> {
        match self {
            Self::Draw(props) => Some(props),
            Self::Fixed(_) => None,
        }
    }
}

/// A [`PipelineBackend`] that counts what it builds and can be told to fail.
#[derive(Default)]
pub struct MockBackend {
    /// How long every pipeline build takes.
    pub build_delay: Duration,
    vertex_builds: Mutex<HashMap<VertexShaderKey, usize>>,
    fragment_builds: Mutex<HashMap<ShaderKey, usize>>,
    pipeline_builds: Mutex<HashMap<PipelineKey, usize>>,
    fixed_builds: Mutex<HashMap<FixedPipeline, usize>>,
    failing: Mutex<HashSet<PipelineKey>>,
    failing_fixed: Mutex<HashSet<FixedPipeline>>,
    /// Built, but reported as still compiling.
    not_ready: Mutex<HashSet<PipelineKey>>,
    /// Built, but reported as failed once asked about.
    errored: Mutex<HashSet<PipelineKey>>,
    status_queries: Mutex<HashMap<PipelineKey, usize>>,
    advance_succeeds: AtomicBool,
    threads: Mutex<HashSet<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build_delay(delay: Duration) -> Self {
        Self {
            build_delay: delay,
            ..Self::default()
        }
    }

    pub fn fail(&self, props: &PipelineProps) {
        lock(&self.failing).insert(props.key());
    }

    pub fn fail_fixed(&self, kind: FixedPipeline) {
        lock(&self.failing_fixed).insert(kind);
    }

    pub fn set_not_ready(&self, props: &PipelineProps, not_ready: bool) {
        let mut set = lock(&self.not_ready);
        if not_ready {
            set.insert(props.key());
        } else {
            set.remove(&props.key());
        }
    }

    pub fn set_errored(&self, props: &PipelineProps) {
        lock(&self.errored).insert(props.key());
    }

    /// How many times the status of the pipeline for `props` was asked for.
    pub fn status_queries(&self, props: &PipelineProps) -> usize {
        lock(&self.status_queries)
            .get(&props.key())
            .copied()
            .unwrap_or(0)
    }

    /// Whether nudging a not ready pipeline makes it usable.
    pub fn set_advance_succeeds(&self, succeeds: bool) {
        self.advance_succeeds.store(succeeds, Ordering::Relaxed);
    }

    pub fn pipeline_builds(&self, props: &PipelineProps) -> usize {
        lock(&self.pipeline_builds)
            .get(&props.key())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_pipeline_builds(&self) -> usize {
        lock(&self.pipeline_builds).values().sum()
    }

    /// Keys built more than once.
    pub fn duplicate_builds(&self) -> Vec<PipelineKey> {
        lock(&self.pipeline_builds)
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn vertex_shader_builds(&self) -> usize {
        lock(&self.vertex_builds).values().sum()
    }

    pub fn fragment_shader_builds(&self) -> usize {
        lock(&self.fragment_builds).values().sum()
    }

    pub fn fixed_builds(&self, kind: FixedPipeline) -> usize {
        lock(&self.fixed_builds).get(&kind).copied().unwrap_or(0)
    }

    /// Names of the threads pipelines were built on.
    pub fn build_threads(&self) -> HashSet<String> {
        lock(&self.threads).clone()
    }
}

impl PipelineBackend for MockBackend {
    type VertexShader = VertexShaderKey;
    type FragmentShader = ShaderKey;
    type Pipeline = MockPipeline;

    fn create_vertex_shader(&self, props: &ShaderProps) -> MockResult<VertexShaderKey> {
        let key = props.vertex_key();
        *lock(&self.vertex_builds).entry(key).or_default() += 1;
        Ok(key)
    }

    fn create_fragment_shader(&self, props: &ShaderProps) -> MockResult<ShaderKey> {
        let key = props.key();
        *lock(&self.fragment_builds).entry(key).or_default() += 1;
        Ok(key)
    }

    fn create_pipeline(
        &self,
        props: &PipelineProps,
        vertex: &VertexShaderKey,
        fragment: &ShaderKey,
    ) -> MockResult<MockPipeline> {
        assert_eq!(*vertex, props.shader.vertex_key());
        assert_eq!(*fragment, props.shader.key());
        if !self.build_delay.is_zero() {
            std::thread::sleep(self.build_delay);
        }
        let key = props.key();
        *lock(&self.pipeline_builds).entry(key).or_default() += 1;
        if let Some(name) = std::thread::current().name() {
            lock(&self.threads).insert(name.to_owned());
        }
        if lock(&self.failing).contains(&key) {
            log::debug!("Failing build of {key:?}");
            return Err(Error::PipelineCreation {
                key,
                message: "rejected by the mock backend".into(),
            });
        }
        Ok(MockPipeline::Draw(*props))
    }

    fn create_fixed_pipeline(&self, kind: FixedPipeline) -> MockResult<MockPipeline> {
        *lock(&self.fixed_builds).entry(kind).or_default() += 1;
        if lock(&self.failing_fixed).contains(&kind) {
            return Err(Error::FixedPipeline(kind));
        }
        Ok(MockPipeline::Fixed(kind))
    }

    fn pipeline_status(&self, pipeline: &MockPipeline) -> PipelineStatus {
        let Some(key) = pipeline.key() else {
            return PipelineStatus::Ready;
        };
        *lock(&self.status_queries).entry(key).or_default() += 1;
        if lock(&self.errored).contains(&key) {
            PipelineStatus::Errored
        } else if lock(&self.not_ready).contains(&key) {
            PipelineStatus::NotReady
        } else {
            PipelineStatus::Ready
        }
    }

    fn advance_creation(&self, _: &MockPipeline) -> bool {
        self.advance_succeeds.load(Ordering::Relaxed)
    }
}

/// Pipeline props for a draw with the default options.
pub fn draw_props(
    draw_type: DrawType,
    features: ShaderFeatures,
    interlock_mode: InterlockMode,
) -> PipelineProps {
    PipelineProps::new(ShaderProps::new(
        draw_type,
        features,
        interlock_mode,
        ShaderMiscFlags::empty(),
    ))
}

/// Polls until the exact pipeline for `props` is built, or `timeout` elapses.
pub fn wait_until_built(
    manager: &AsyncPipelineManager<MockBackend>,
    props: &PipelineProps,
    timeout: Duration,
) -> Result<PipelineStatus> {
    let start = Instant::now();
    loop {
        match manager.pipeline_status(props) {
            Some(PipelineStatus::NotReady) | None => {}
            Some(status) => return Ok(status),
        }
        if start.elapsed() > timeout {
            bail!("{:?} wasn't built within {timeout:?}", props.key());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Storage that records every upload and counts how many instances are still alive.
pub struct MockRingStorage {
    pub id: usize,
    pub uploads: Vec<(usize, Vec<u8>)>,
    live: Arc<AtomicUsize>,
}

impl MockRingStorage {
    /// Creates storages sharing one live counter.
    pub fn factory() -> MockRingStorageFactory {
        MockRingStorageFactory::default()
    }
}

impl RingStorage for MockRingStorage {
    fn map_slot(&mut self, _: usize, _: usize) -> Option<&mut [u8]> {
        None
    }

    fn unmap_slot(&mut self, _: usize, _: usize) {}

    fn update_slot(&mut self, slot: usize, bytes: &[u8]) {
        self.uploads.push((slot, bytes.to_vec()));
    }
}

impl Drop for MockRingStorage {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct MockRingStorageFactory {
    created: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl MockRingStorageFactory {
    pub fn create(&self) -> MockRingStorage {
        self.live.fetch_add(1, Ordering::Relaxed);
        MockRingStorage {
            id: self.created.fetch_add(1, Ordering::Relaxed),
            uploads: Vec::new(),
            live: self.live.clone(),
        }
    }

    /// Storages created and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// Storage that remembers the frame each slot was last submitted in, and records every slot
/// mapped again before the GPU finished that frame.
pub struct FencedRingStorage {
    clock: FrameClock,
    submissions: Vec<Option<u64>>,
    /// `(slot, frame)` of every slot reused while `frame` was still in flight.
    pub reused_in_flight: Vec<(usize, u64)>,
    pub maps: usize,
}

impl FencedRingStorage {
    pub fn new(clock: FrameClock, slot_count: usize) -> Self {
        Self {
            clock,
            submissions: vec![None; slot_count],
            reused_in_flight: Vec::new(),
            maps: 0,
        }
    }
}

impl RingStorage for FencedRingStorage {
    fn map_slot(&mut self, slot: usize, _: usize) -> Option<&mut [u8]> {
        self.maps += 1;
        if let Some(frame) = self.submissions[slot] {
            if frame > self.clock.safe_frame() {
                self.reused_in_flight.push((slot, frame));
            }
        }
        None
    }

    fn unmap_slot(&mut self, _: usize, _: usize) {}

    fn update_slot(&mut self, slot: usize, _: &[u8]) {
        self.submissions[slot] = Some(self.clock.current_frame());
    }
}
