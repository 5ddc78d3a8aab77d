// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pipeline creation on a background thread, with ubershader fallbacks.
//!
//! Every draw type has an "ubershader": the permutation with every feature the draw type can
//! use turned on. It renders any batch of that draw type correctly, just slower than a
//! permutation tailored to the batch. When a tailored permutation is requested for the first
//! time, [`AsyncPipelineManager`] queues it for compilation and returns the ubershader, so the
//! render thread never waits for a specific permutation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use vellum_encoding::ShaderKey;

use crate::backend::{PipelineBackend, PipelineKey, PipelineProps, PipelineStatus};
use crate::shader_manager::{ShaderCache, VertexShaderManager};
use crate::{lock, Error, PlatformCapabilities, Result};

/// When pipelines are allowed to be compiled off the render thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompilationMode {
    /// Build every requested permutation on the calling thread, and wait for it.
    AlwaysSynchronous,
    /// Only ever build ubershaders. Requests for any other permutation are redirected.
    OnlyUbershaders,
    /// Build ubershaders synchronously and everything else in the background.
    #[default]
    AllowAsynchronous,
}

/// Options which are set at pipeline manager creation time.
#[derive(Clone, Debug)]
pub struct PipelineManagerOptions {
    pub compilation_mode: CompilationMode,
    /// Name given to the background compilation thread.
    pub thread_name: String,
}

impl Default for PipelineManagerOptions {
    fn default() -> Self {
        Self {
            compilation_mode: CompilationMode::default(),
            thread_name: "vellum-pipeline-compiler".into(),
        }
    }
}

enum Slot<P> {
    /// Claimed by a caller or queued for the background thread.
    Building,
    Built(Arc<P>),
    /// The build failed, with the backend's message.
    Failed(Arc<str>),
}

impl<P> Slot<P> {
    fn from_result(result: &Result<Arc<P>>) -> Self {
        match result {
            Ok(pipeline) => Self::Built(pipeline.clone()),
            Err(err) => Self::Failed(err.to_string().into()),
        }
    }
}

/// What a caller found when it looked up a key.
enum Lookup<P> {
    /// The caller claimed the key and must build it itself.
    Claimed,
    Found(Arc<P>),
    /// Queued or building elsewhere.
    Pending,
    Failed(Arc<str>),
}

struct State<P> {
    pipelines: HashMap<PipelineKey, Slot<P>>,
    /// Jobs for the background thread, oldest first.
    queue: VecDeque<PipelineProps>,
    /// Jobs the background thread has finished, not yet moved into `pipelines`.
    completed: Vec<(PipelineKey, Slot<P>)>,
    /// The background thread is building a job it has popped from the queue.
    in_flight: bool,
    done: bool,
}

impl<P> State<P> {
    fn drain_completed(&mut self) {
        for (key, slot) in self.completed.drain(..) {
            self.pipelines.insert(key, slot);
        }
    }

    fn is_building(&self, key: PipelineKey) -> bool {
        matches!(self.pipelines.get(&key), Some(Slot::Building))
    }
}

struct Shared<B: PipelineBackend> {
    backend: B,
    state: Mutex<State<B::Pipeline>>,
    /// Signalled when a job is queued, or when the background thread should exit.
    job_available: Condvar,
    /// Signalled whenever a build finishes, on any thread.
    job_finished: Condvar,
    vertex_shaders: VertexShaderManager<B::VertexShader>,
    fragment_shaders: ShaderCache<ShaderKey, B::FragmentShader>,
}

fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar
        .wait(guard)
        .unwrap_or_else(PoisonError::into_inner)
}

impl<B: PipelineBackend> Shared<B> {
    fn build(&self, props: &PipelineProps) -> Result<Arc<B::Pipeline>> {
        log::debug!("Building pipeline {:?}", props.key());
        let vertex_props = props.shader.vertex();
        let vertex = self
            .vertex_shaders
            .get_or_create(props.shader.vertex_key(), || {
                self.backend.create_vertex_shader(&vertex_props)
            })?;
        let fragment = self
            .fragment_shaders
            .get_or_create(props.shader.key(), || {
                self.backend.create_fragment_shader(&props.shader)
            })?;
        let pipeline = self.backend.create_pipeline(props, &vertex, &fragment)?;
        Ok(Arc::new(pipeline))
    }

    fn run_worker(&self) {
        log::info!("Pipeline compilation thread started");
        let mut state = lock(&self.state);
        loop {
            if state.done {
                break;
            }
            let Some(props) = state.queue.pop_front() else {
                state = wait(&self.job_available, state);
                continue;
            };
            state.in_flight = true;
            drop(state);

            let key = props.key();
            let result = self.build(&props);
            if let Err(err) = &result {
                log::warn!("Failed to build pipeline {key:?}: {err}");
            }

            state = lock(&self.state);
            state.completed.push((key, Slot::from_result(&result)));
            state.in_flight = false;
            self.job_finished.notify_all();
        }
        log::debug!("Pipeline compilation thread exiting");
    }
}

static WARNED_ABOUT_FALLBACK: AtomicBool = AtomicBool::new(false);

/// A cache of draw pipelines keyed by [`PipelineKey`], filled in the background.
///
/// Each key is built at most once. Failures are cached as well, and only forgotten by
/// [`clear_cache`](Self::clear_cache).
pub struct AsyncPipelineManager<B: PipelineBackend> {
    shared: Arc<Shared<B>>,
    options: PipelineManagerOptions,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Spawning the background thread failed, so every build is synchronous.
    spawn_failed: AtomicBool,
}

impl<B: PipelineBackend> AsyncPipelineManager<B> {
    pub fn new(backend: B, options: PipelineManagerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                state: Mutex::new(State {
                    pipelines: HashMap::new(),
                    queue: VecDeque::new(),
                    completed: Vec::new(),
                    in_flight: false,
                    done: false,
                }),
                job_available: Condvar::new(),
                job_finished: Condvar::new(),
                vertex_shaders: VertexShaderManager::new(),
                fragment_shaders: ShaderCache::new(),
            }),
            options,
            worker: Mutex::new(None),
            spawn_failed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn options(&self) -> &PipelineManagerOptions {
        &self.options
    }

    /// Returns a pipeline that can draw `props`: the exact permutation if it is ready, the
    /// ubershader for the same draw type otherwise.
    ///
    /// This only blocks when the ubershader itself has to be built, or when the compilation
    /// mode requires synchronous builds. It fails only if the ubershader can't be built.
    pub fn try_get_pipeline(
        &self,
        props: &PipelineProps,
        caps: &PlatformCapabilities,
    ) -> Result<Arc<B::Pipeline>> {
        let ubershader =
            props.with_features(caps.ubershader_features(props.draw_type(), props.interlock_mode()));
        let props = match self.options.compilation_mode {
            CompilationMode::OnlyUbershaders => ubershader,
            _ => *props,
        };
        let key = props.key();
        let is_ubershader = key == ubershader.key();
        let synchronous =
            is_ubershader || self.options.compilation_mode != CompilationMode::AllowAsynchronous;

        let lookup = {
            let mut state = lock(&self.shared.state);
            loop {
                match state.pipelines.get(&key) {
                    None => {
                        state.pipelines.insert(key, Slot::Building);
                        if synchronous || !self.ensure_worker() {
                            break Lookup::Claimed;
                        }
                        state.queue.push_back(props);
                        self.shared.job_available.notify_one();
                        break Lookup::Pending;
                    }
                    Some(Slot::Built(pipeline)) => break Lookup::Found(pipeline.clone()),
                    Some(Slot::Failed(message)) => break Lookup::Failed(message.clone()),
                    Some(Slot::Building) => {
                        state.drain_completed();
                        if !state.is_building(key) {
                            continue;
                        }
                        // Another caller is building a synchronous key; wait for it rather
                        // than building it twice.
                        if !synchronous {
                            break Lookup::Pending;
                        }
                        state = wait(&self.shared.job_finished, state);
                    }
                }
            }
        };

        let failure = match lookup {
            Lookup::Claimed => {
                let result = self.shared.build(&props);
                lock(&self.shared.state)
                    .pipelines
                    .insert(key, Slot::from_result(&result));
                self.shared.job_finished.notify_all();
                match result {
                    // A pipeline that was just built is handed out even if the backend is
                    // still finishing it.
                    Ok(pipeline) => return Ok(pipeline),
                    Err(err) => {
                        log::warn!("Failed to build pipeline {key:?}: {err}");
                        Some(Arc::from(err.to_string()))
                    }
                }
            }
            Lookup::Found(pipeline) => match self.shared.backend.pipeline_status(&pipeline) {
                PipelineStatus::Ready => return Ok(pipeline),
                // There is nothing to fall back to from an ubershader. The backend waits
                // for it when drawing.
                PipelineStatus::NotReady
                    if is_ubershader || self.shared.backend.advance_creation(&pipeline) =>
                {
                    return Ok(pipeline);
                }
                PipelineStatus::NotReady => None,
                PipelineStatus::Errored => {
                    let message: Arc<str> = "the backend failed to compile it".into();
                    log::warn!("Pipeline {key:?} failed to compile");
                    lock(&self.shared.state)
                        .pipelines
                        .insert(key, Slot::Failed(message.clone()));
                    Some(message)
                }
            },
            Lookup::Pending => None,
            Lookup::Failed(message) => Some(message),
        };

        if is_ubershader {
            let message = failure.map_or_else(|| "not built".into(), |message| message.to_string());
            log::error!("Ubershader {key:?} is unavailable: {message}");
            return Err(Error::UbershaderUnavailable {
                key: key.shader_key(),
                message,
            });
        }
        if !WARNED_ABOUT_FALLBACK.swap(true, Ordering::Relaxed) {
            log::warn!("Drawing with ubershaders while shader permutations compile");
        }
        self.try_get_pipeline(&ubershader, caps)
    }

    /// Where the exact pipeline for `props` is, without triggering a build.
    ///
    /// Returns `None` if it has never been requested.
    pub fn pipeline_status(&self, props: &PipelineProps) -> Option<PipelineStatus> {
        let pipeline = {
            let mut state = lock(&self.shared.state);
            state.drain_completed();
            match state.pipelines.get(&props.key())? {
                Slot::Building => return Some(PipelineStatus::NotReady),
                Slot::Failed(_) => return Some(PipelineStatus::Errored),
                Slot::Built(pipeline) => pipeline.clone(),
            }
        };
        Some(self.shared.backend.pipeline_status(&pipeline))
    }

    /// Number of background jobs queued or being built.
    pub fn pending_job_count(&self) -> usize {
        let state = lock(&self.shared.state);
        state.queue.len() + usize::from(state.in_flight)
    }

    /// Drops every cached pipeline and shader.
    ///
    /// Queued jobs are abandoned. A job that is already being built is waited for.
    pub fn clear_cache(&self) {
        let mut state = lock(&self.shared.state);
        state.queue.clear();
        while state.in_flight {
            state = wait(&self.shared.job_finished, state);
        }
        state.completed.clear();
        state.pipelines.clear();
        drop(state);
        self.shared.vertex_shaders.clear();
        self.shared.fragment_shaders.clear();
        // Wake anyone waiting on a key that no longer exists.
        self.shared.job_finished.notify_all();
    }

    /// Starts the background thread if needed. Returns whether one is running.
    fn ensure_worker(&self) -> bool {
        if self.spawn_failed.load(Ordering::Relaxed) {
            return false;
        }
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return true;
        }
        let shared = self.shared.clone();
        match std::thread::Builder::new()
            .name(self.options.thread_name.clone())
            .spawn(move || shared.run_worker())
        {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(err) => {
                log::warn!(
                    "{}; building pipelines synchronously",
                    Error::ThreadSpawn(err)
                );
                self.spawn_failed.store(true, Ordering::Relaxed);
                false
            }
        }
    }
}

impl<B: PipelineBackend> Drop for AsyncPipelineManager<B> {
    fn drop(&mut self) {
        lock(&self.shared.state).done = true;
        self.shared.job_available.notify_all();
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Pipeline compilation thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use vellum_encoding::{DrawType, InterlockMode, ShaderFeatures, ShaderMiscFlags, ShaderProps};

    use super::*;
    use crate::FixedPipeline;

    /// Builds pipelines that remember their key.
    struct KeyBackend;

    impl PipelineBackend for KeyBackend {
        type VertexShader = ();
        type FragmentShader = ();
        type Pipeline = PipelineKey;

        fn create_vertex_shader(&self, _: &ShaderProps) -> Result<()> {
            Ok(())
        }

        fn create_fragment_shader(&self, _: &ShaderProps) -> Result<()> {
            Ok(())
        }

        fn create_pipeline(&self, props: &PipelineProps, _: &(), _: &()) -> Result<PipelineKey> {
            Ok(props.key())
        }

        fn create_fixed_pipeline(&self, kind: FixedPipeline) -> Result<PipelineKey> {
            Err(Error::FixedPipeline(kind))
        }

        fn pipeline_status(&self, _: &PipelineKey) -> PipelineStatus {
            PipelineStatus::Ready
        }
    }

    static_assertions::assert_impl_all!(AsyncPipelineManager<KeyBackend>: Send, Sync);

    fn props(features: ShaderFeatures) -> PipelineProps {
        PipelineProps::new(ShaderProps::new(
            DrawType::MidpointFanPatches,
            features,
            InterlockMode::RasterOrdering,
            ShaderMiscFlags::empty(),
        ))
    }

    #[test]
    fn synchronous_mode_returns_exact_pipelines() {
        let manager = AsyncPipelineManager::new(
            KeyBackend,
            PipelineManagerOptions {
                compilation_mode: CompilationMode::AlwaysSynchronous,
                ..Default::default()
            },
        );
        let caps = PlatformCapabilities::default();
        let props = props(ShaderFeatures::EVEN_ODD);
        assert_eq!(*manager.try_get_pipeline(&props, &caps).unwrap(), props.key());
        assert_eq!(manager.pipeline_status(&props), Some(PipelineStatus::Ready));
        assert_eq!(manager.pending_job_count(), 0);
    }

    #[test]
    fn only_ubershaders() {
        let manager = AsyncPipelineManager::new(
            KeyBackend,
            PipelineManagerOptions {
                compilation_mode: CompilationMode::OnlyUbershaders,
                ..Default::default()
            },
        );
        let caps = PlatformCapabilities::default();
        let props = props(ShaderFeatures::EVEN_ODD);
        let ubershader = props.with_features(ShaderFeatures::all());
        assert_eq!(*manager.try_get_pipeline(&props, &caps).unwrap(), ubershader.key());
        assert_eq!(manager.pipeline_status(&props), None);
    }

    #[test]
    fn clear_cache_forgets_pipelines() {
        let manager = AsyncPipelineManager::new(KeyBackend, PipelineManagerOptions::default());
        let caps = PlatformCapabilities::default();
        let props = props(ShaderFeatures::all());
        manager.try_get_pipeline(&props, &caps).unwrap();
        assert!(manager.pipeline_status(&props).is_some());
        manager.clear_cache();
        assert_eq!(manager.pipeline_status(&props), None);
    }
}
