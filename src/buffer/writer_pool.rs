// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

use crate::service::WriterPoolConfig;

/// A writable region handed out by a [`WriterPool`].
///
/// Derefs to `BytesMut`, so callers fill it in place with `BufMut`
/// methods. A writer remembers the bucket it came from; writers
/// allocated above the largest bucket carry no bucket and are simply
/// freed on release.
#[derive(Debug)]
pub struct Writer {
    buf: BytesMut,
    bucket: Option<usize>,
    class_capacity: usize,
}

impl Writer {
    /// Capacity of the size class this writer was drawn from.
    pub fn class_capacity(&self) -> usize {
        self.class_capacity
    }

    pub fn is_pooled(&self) -> bool {
        self.bucket.is_some()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..]
    }
}

impl Deref for Writer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for Writer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: usize,
    idle: Mutex<Vec<BytesMut>>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    allocated: AtomicU64,
    reused: AtomicU64,
    fallbacks: AtomicU64,
    returned: AtomicU64,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// fresh regions created for a bucket
    pub allocated: u64,
    /// regions served from a bucket's idle list
    pub reused: u64,
    /// requests above the largest bucket
    pub fallbacks: u64,
    /// regions put back into an idle list
    pub returned: u64,
}

/// Bucketed pool of reusable writable regions.
///
/// A request is served from the smallest bucket whose capacity covers it.
/// Build one instance at startup and share it by `Arc`.
#[derive(Debug)]
pub struct WriterPool {
    buckets: Vec<Bucket>,
    max_idle_per_bucket: usize,
    counters: PoolCounters,
}

impl WriterPool {
    pub fn new(bucket_sizes: &[usize], max_idle_per_bucket: usize) -> Self {
        let mut sizes: Vec<usize> = bucket_sizes.iter().copied().filter(|s| *s > 0).collect();
        sizes.sort_unstable();
        sizes.dedup();

        let buckets = sizes
            .into_iter()
            .map(|capacity| Bucket {
                capacity,
                idle: Mutex::new(Vec::new()),
            })
            .collect();

        WriterPool {
            buckets,
            max_idle_per_bucket,
            counters: PoolCounters::default(),
        }
    }

    pub fn from_config(config: &WriterPoolConfig) -> Self {
        Self::new(&config.buckets, config.max_idle_per_bucket)
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.capacity).collect()
    }

    /// Draws a writer holding at least `capacity` bytes.
    pub fn get(&self, capacity: usize) -> Writer {
        let index = self.buckets.partition_point(|b| b.capacity < capacity);
        let Some(bucket) = self.buckets.get(index) else {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            trace!("writer pool fallback allocation of {} bytes", capacity);
            return Writer {
                buf: BytesMut::with_capacity(capacity),
                bucket: None,
                class_capacity: capacity,
            };
        };

        let reused = bucket.idle.lock().pop();
        let buf = match reused {
            Some(buf) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.counters.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(bucket.capacity)
            }
        };

        Writer {
            buf,
            bucket: Some(index),
            class_capacity: bucket.capacity,
        }
    }

    /// Gives a writer back. Non-pooled writers and writers whose region
    /// no longer covers their class are dropped.
    pub fn put(&self, writer: Writer) {
        let Writer {
            mut buf, bucket, ..
        } = writer;
        let Some(bucket) = bucket.and_then(|index| self.buckets.get(index)) else {
            return;
        };

        buf.clear();
        if buf.capacity() < bucket.capacity {
            return;
        }

        let mut idle = bucket.idle.lock();
        if idle.len() < self.max_idle_per_bucket {
            idle.push(buf);
            self.counters.returned.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of idle regions held by the bucket serving `capacity`.
    pub fn idle_count(&self, capacity: usize) -> usize {
        let index = self.buckets.partition_point(|b| b.capacity < capacity);
        self.buckets
            .get(index)
            .map(|b| b.idle.lock().len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
        }
    }
}

impl Default for WriterPool {
    fn default() -> Self {
        Self::from_config(&WriterPoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn test_smallest_covering_bucket() {
        let pool = WriterPool::new(&[128, 32, 64], 16);
        assert_eq!(pool.bucket_sizes(), vec![32, 64, 128]);

        let writer = pool.get(100);
        assert!(writer.is_pooled());
        assert_eq!(writer.class_capacity(), 128);
        assert!(writer.capacity() >= 128);

        let writer = pool.get(32);
        assert_eq!(writer.class_capacity(), 32);
        let writer = pool.get(0);
        assert_eq!(writer.class_capacity(), 32);
    }

    #[test]
    fn test_fallback_above_largest_bucket() {
        let pool = WriterPool::new(&[32, 64, 128], 16);
        let writer = pool.get(129);
        assert!(!writer.is_pooled());
        assert!(writer.capacity() >= 129);

        pool.put(writer);
        assert_eq!(pool.idle_count(128), 0);
        assert_eq!(pool.stats().fallbacks, 1);
        assert_eq!(pool.stats().returned, 0);
    }

    #[test]
    fn test_release_then_reuse() {
        let pool = WriterPool::new(&[32, 64, 128], 16);
        let mut writer = pool.get(100);
        writer.put_slice(b"hello");
        pool.put(writer);
        assert_eq!(pool.idle_count(100), 1);

        let writer = pool.get(90);
        // region comes back cleared
        assert!(writer.is_empty());
        assert_eq!(writer.class_capacity(), 128);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(pool.idle_count(100), 0);
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool = WriterPool::new(&[32], 1);
        let first = pool.get(8);
        let second = pool.get(8);
        pool.put(first);
        pool.put(second);
        assert_eq!(pool.idle_count(8), 1);
    }

    #[test]
    fn test_zero_sized_buckets_are_ignored() {
        let pool = WriterPool::new(&[0, 64, 64], 4);
        assert_eq!(pool.bucket_sizes(), vec![64]);
    }
}
