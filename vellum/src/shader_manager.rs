// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Caches of compiled shaders, shared between the render thread and the compilation thread.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock};

use vellum_encoding::{ShaderKey, VertexShaderKey};

use crate::{lock, Error, Result};

/// A key that identifies a shader in a [`ShaderCache`].
pub trait CacheKey: Copy + Eq + Hash + Debug + Send + 'static {
    fn shader_key(&self) -> ShaderKey;
}

impl CacheKey for ShaderKey {
    fn shader_key(&self) -> ShaderKey {
        *self
    }
}

impl CacheKey for VertexShaderKey {
    fn shader_key(&self) -> ShaderKey {
        self.0
    }
}

/// `None` records a failed build.
type Cell<S> = Arc<OnceLock<Option<Arc<S>>>>;

/// Builds each shader at most once, however many threads ask for it.
///
/// The map lock is only held to find the cell for a key. The first caller builds the shader
/// outside of it, and other callers for the same key block on the cell until it is filled.
/// Failures are remembered until [`clear`](Self::clear).
pub struct ShaderCache<K, S> {
    cells: Mutex<HashMap<K, Cell<S>>>,
}

/// The cache of vertex shaders, which are shared by every fragment permutation that only
/// differs in fragment features.
pub type VertexShaderManager<S> = ShaderCache<VertexShaderKey, S>;

impl<K: CacheKey, S> Default for ShaderCache<K, S> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: CacheKey, S> ShaderCache<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shader for `key`, calling `build` if nobody has built it yet.
    ///
    /// Only the caller whose `build` failed sees the original error; later callers get
    /// [`Error::ShaderCreation`].
    pub fn get_or_create(&self, key: K, build: impl FnOnce() -> Result<S>) -> Result<Arc<S>> {
        let cell = lock(&self.cells).entry(key).or_default().clone();
        let mut build_error = None;
        let shader = cell.get_or_init(|| {
            log::debug!("Building shader {key:?}");
            match build() {
                Ok(shader) => Some(Arc::new(shader)),
                Err(err) => {
                    log::warn!("Failed to build shader {key:?}: {err}");
                    build_error = Some(err);
                    None
                }
            }
        });
        match shader {
            Some(shader) => Ok(shader.clone()),
            None => Err(build_error.unwrap_or_else(|| Error::ShaderCreation {
                key: key.shader_key(),
                message: "an earlier build of this shader failed".into(),
            })),
        }
    }

    /// Returns the shader for `key` if it has been built successfully.
    pub fn get(&self, key: K) -> Option<Arc<S>> {
        let cell = lock(&self.cells).get(&key)?.clone();
        cell.get().cloned().flatten()
    }

    /// Number of keys that have been requested.
    pub fn len(&self) -> usize {
        lock(&self.cells).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every shader. Shaders still referenced elsewhere stay alive until released.
    pub fn clear(&self) {
        lock(&self.cells).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn builds_once() {
        let cache = ShaderCache::<ShaderKey, u32>::new();
        let builds = AtomicU32::new(0);
        let build = || {
            builds.fetch_add(1, Ordering::Relaxed);
            Ok(7)
        };
        assert_eq!(*cache.get_or_create(ShaderKey(1), build).unwrap(), 7);
        assert_eq!(*cache.get_or_create(ShaderKey(1), build).unwrap(), 7);
        assert_eq!(builds.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failures_are_cached() {
        let cache = ShaderCache::<VertexShaderKey, u32>::new();
        let key = VertexShaderKey(ShaderKey(9));
        let first = cache.get_or_create(key, || {
            Err(Error::ShaderCreation {
                key: key.0,
                message: "syntax error".into(),
            })
        });
        match first {
            Err(Error::ShaderCreation { message, .. }) => assert_eq!(message, "syntax error"),
            other => panic!("unexpected {other:?}"),
        }
        let second = cache.get_or_create(key, || Ok(1));
        assert!(matches!(second, Err(Error::ShaderCreation { .. })));
        assert!(cache.get(key).is_none());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_create(key, || Ok(1)).unwrap(), 1);
    }
}
