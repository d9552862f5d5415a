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

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::{Writer, WriterPool};

const UNKNOWN_LEN: usize = usize::MAX;

/// Which end of a [`NocopyBuffer`] a new node is linked to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Head,
    #[default]
    Tail,
}

enum NodeData {
    /// caller-owned region, never copied and never pooled
    Mounted(Bytes),
    /// region drawn from a pool, handed back on release
    Pooled {
        writer: Writer,
        pool: Arc<WriterPool>,
    },
    Released,
}

/// One chunk of a [`NocopyBuffer`].
pub struct NocopyNode {
    data: NodeData,
}

impl NocopyNode {
    fn mounted(data: Bytes) -> Self {
        NocopyNode {
            data: NodeData::Mounted(data),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.data, NodeData::Pooled { .. })
    }

    pub fn is_released(&self) -> bool {
        matches!(self.data, NodeData::Released)
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            NodeData::Mounted(bytes) => bytes,
            NodeData::Pooled { writer, .. } => writer.as_slice(),
            NodeData::Released => &[],
        }
    }

    /// Drops the node's region, returning it to its pool if it has one.
    /// The node stays linked but empty.
    pub fn release(&mut self) {
        if let NodeData::Pooled { writer, pool } =
            std::mem::replace(&mut self.data, NodeData::Released)
        {
            pool.put(writer);
        }
    }
}

impl Drop for NocopyNode {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for NocopyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.data {
            NodeData::Mounted(_) => "mounted",
            NodeData::Pooled { .. } => "pooled",
            NodeData::Released => "released",
        };
        f.debug_struct("NocopyNode")
            .field("origin", &origin)
            .field("len", &self.len())
            .finish()
    }
}

/// A logical byte stream made of independently owned chunks.
///
/// Mounting links a caller's `Bytes` without copying; allocating links a
/// pool region that the caller fills in place. Nothing is concatenated
/// until the stream hits the socket.
pub struct NocopyBuffer {
    nodes: VecDeque<NocopyNode>,
    // UNKNOWN_LEN until the next len() after a structural change
    len: AtomicUsize,
    pool: Arc<WriterPool>,
}

impl NocopyBuffer {
    pub fn new(pool: Arc<WriterPool>) -> Self {
        NocopyBuffer {
            nodes: VecDeque::new(),
            len: AtomicUsize::new(0),
            pool,
        }
    }

    /// Total number of bytes across all nodes.
    pub fn len(&self) -> usize {
        let cached = self.len.load(Ordering::Relaxed);
        if cached != UNKNOWN_LEN {
            return cached;
        }
        let len: usize = self.nodes.iter().map(NocopyNode::len).sum();
        self.len.store(len, Ordering::Relaxed);
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Links `data` as a new node. The region must not be mutated by the
    /// caller afterwards, `Bytes` enforces that.
    pub fn mount(&mut self, data: impl Into<Bytes>, whence: Whence) {
        self.link(NocopyNode::mounted(data.into()), whence);
    }

    /// Links a pool region of at least `capacity` bytes and returns it for
    /// filling in place.
    pub fn allocate(&mut self, capacity: usize, whence: Whence) -> &mut Writer {
        let node = NocopyNode {
            data: NodeData::Pooled {
                writer: self.pool.get(capacity),
                pool: self.pool.clone(),
            },
        };
        let node = self.link(node, whence);
        match &mut node.data {
            NodeData::Pooled { writer, .. } => writer,
            _ => unreachable!("freshly allocated node is pool backed"),
        }
    }

    fn link(&mut self, node: NocopyNode, whence: Whence) -> &mut NocopyNode {
        self.len.store(UNKNOWN_LEN, Ordering::Relaxed);
        match whence {
            Whence::Head => {
                self.nodes.push_front(node);
                &mut self.nodes[0]
            }
            Whence::Tail => {
                self.nodes.push_back(node);
                let last = self.nodes.len() - 1;
                &mut self.nodes[last]
            }
        }
    }

    /// Visits nodes front to back until `visit` returns false. The visitor
    /// may release the node it is handed.
    pub fn for_each<F>(&mut self, mut visit: F)
    where
        F: FnMut(&mut NocopyNode) -> bool,
    {
        self.len.store(UNKNOWN_LEN, Ordering::Relaxed);
        for node in self.nodes.iter_mut() {
            if !visit(node) {
                break;
            }
        }
    }

    /// Borrowed view of every non-empty chunk, front to back.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.nodes
            .iter()
            .map(NocopyNode::as_slice)
            .filter(|chunk| !chunk.is_empty())
    }

    /// Contiguous copy of the stream.
    pub fn copy_to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    /// Returns pooled regions and empties the buffer so it can be reused.
    pub fn release(&mut self) {
        // NocopyNode::drop hands pooled regions back
        self.nodes.clear();
        self.len.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for NocopyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NocopyBuffer")
            .field("nodes", &self.nodes)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    fn pool() -> Arc<WriterPool> {
        Arc::new(WriterPool::new(&[32, 64, 128], 16))
    }

    #[test]
    fn test_mounted_length_and_release() {
        let mut buffer = NocopyBuffer::new(pool());
        buffer.mount(Bytes::from_static(b"hello"), Whence::Tail);
        buffer.mount(Bytes::from_static(b"tethers"), Whence::Tail);
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer.node_count(), 2);

        buffer.release();
        let mut visited = 0;
        buffer.for_each(|_| {
            visited += 1;
            true
        });
        assert_eq!(visited, 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mount_does_not_copy() {
        let data = Bytes::from(vec![7u8; 48]);
        let ptr = data.as_ptr();
        let mut buffer = NocopyBuffer::new(pool());
        buffer.mount(data, Whence::Tail);
        assert_eq!(buffer.chunks().next().map(|c| c.as_ptr()), Some(ptr));
    }

    #[test]
    fn test_head_and_tail_order() {
        let mut buffer = NocopyBuffer::new(pool());
        buffer.mount(Bytes::from_static(b"body"), Whence::Tail);
        buffer.allocate(4, Whence::Head).put_slice(b"head");
        buffer.mount(Bytes::from_static(b"tail"), Whence::Tail);
        assert_eq!(buffer.copy_to_bytes(), Bytes::from_static(b"headbodytail"));
    }

    #[test]
    fn test_length_cache_invalidated_by_allocate() {
        let mut buffer = NocopyBuffer::new(pool());
        buffer.mount(Bytes::from_static(b"abc"), Whence::Tail);
        assert_eq!(buffer.len(), 3);

        let writer = buffer.allocate(2, Whence::Tail);
        writer.put_u16(0xffee);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_for_each_stops_early_and_can_release() {
        let pool = pool();
        let mut buffer = NocopyBuffer::new(pool.clone());
        buffer.allocate(10, Whence::Tail).put_slice(b"0123456789");
        buffer.mount(Bytes::from_static(b"mounted"), Whence::Tail);
        buffer.mount(Bytes::from_static(b"never"), Whence::Tail);

        let mut visited = 0;
        buffer.for_each(|node| {
            visited += 1;
            node.release();
            visited < 2
        });
        assert_eq!(visited, 2);
        // the pooled node went back during iteration
        assert_eq!(pool.idle_count(10), 1);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_release_returns_pooled_nodes_only() {
        let pool = pool();
        let mut buffer = NocopyBuffer::new(pool.clone());
        buffer.allocate(100, Whence::Tail).put_slice(b"x");
        buffer.allocate(20, Whence::Head).put_slice(b"y");
        buffer.mount(Bytes::from_static(b"caller owned"), Whence::Tail);
        buffer.release();

        assert_eq!(pool.idle_count(100), 1);
        assert_eq!(pool.idle_count(20), 1);
        assert_eq!(pool.stats().returned, 2);

        // the buffer is reusable after release
        buffer.mount(Bytes::from_static(b"again"), Whence::Tail);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_drop_returns_pooled_nodes() {
        let pool = pool();
        {
            let mut buffer = NocopyBuffer::new(pool.clone());
            buffer.allocate(64, Whence::Tail);
        }
        assert_eq!(pool.idle_count(64), 1);
    }
}
