// Copyright 2025 the Vellum Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Splits an instanced draw into draws of at most `max_per_command` instances.
///
/// Yields `(instance_count, base_instance)` pairs.
#[derive(Clone, Debug)]
pub struct InstanceChunker {
    remaining: u32,
    base: u32,
    max_per_command: u32,
}

impl InstanceChunker {
    /// A `max_per_command` of 0 is treated as 1.
    pub fn new(count: u32, base: u32, max_per_command: u32) -> Self {
        Self {
            remaining: count,
            base,
            max_per_command: max_per_command.max(1),
        }
    }

    /// A chunker that only splits when a limit is set.
    pub fn with_limit(count: u32, base: u32, limit: Option<u32>) -> Self {
        Self::new(count, base, limit.unwrap_or(u32::MAX))
    }
}

impl Iterator for InstanceChunker {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let count = self.remaining.min(self.max_per_command);
        let base = self.base;
        self.remaining -= count;
        // Wraps only past the last chunk.
        self.base = self.base.wrapping_add(count);
        Some((count, base))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.remaining.div_ceil(self.max_per_command) as usize;
        (len, Some(len))
    }
}

impl ExactSizeIterator for InstanceChunker {}
