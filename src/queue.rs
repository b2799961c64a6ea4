//! Expiry queue: a doubly linked list of `(hash, expiry)` entries living in an arena.
//!
//! Nodes are addressed by generation-checked [`Handle`]s, so an entry can be unlinked from the
//! middle of the list in O(1) and a stale handle can never unlink a recycled slot. Freed slots go
//! on a free list and are reused by later pushes.

use std::time::SystemTime;

const NIL: u32 = u32::MAX;

/// Stable reference to a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Node {
    hash: u64,
    expiry: SystemTime,
    prev: u32,
    next: u32,
    generation: u32,
    live: bool,
}

#[derive(Debug, Clone)]
pub struct ExpiryQueue {
    nodes: Vec<Node>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl Default for ExpiryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends an entry at the back and returns its handle.
    pub fn push_back(&mut self, hash: u64, expiry: SystemTime) -> Handle {
        let index = match self.free.pop() {
            Some(index) => {
                let node = &mut self.nodes[index as usize];
                node.hash = hash;
                node.expiry = expiry;
                node.prev = self.tail;
                node.next = NIL;
                node.live = true;
                index
            }
            None => {
                let index = self.nodes.len();
                assert!(index < NIL as usize, "expiry queue arena exhausted");
                self.nodes.push(Node {
                    hash,
                    expiry,
                    prev: self.tail,
                    next: NIL,
                    generation: 0,
                    live: true,
                });
                index as u32
            }
        };

        if self.tail == NIL {
            self.head = index;
        } else {
            self.nodes[self.tail as usize].next = index;
        }
        self.tail = index;
        self.len += 1;

        Handle {
            index,
            generation: self.nodes[index as usize].generation,
        }
    }

    /// Unlinks the entry behind `handle` from wherever it sits. Returns `None` if the handle is
    /// stale (already removed, or its slot was recycled).
    pub fn remove(&mut self, handle: Handle) -> Option<(u64, SystemTime)> {
        let node = self.nodes.get(handle.index as usize)?;
        if !node.live || node.generation != handle.generation {
            return None;
        }
        Some(self.unlink(handle.index))
    }

    /// Removes and returns the entry with the earliest position.
    pub fn pop_front(&mut self) -> Option<(u64, SystemTime)> {
        if self.head == NIL {
            return None;
        }
        Some(self.unlink(self.head))
    }

    pub fn front(&self) -> Option<(u64, SystemTime)> {
        if self.head == NIL {
            return None;
        }
        let node = &self.nodes[self.head as usize];
        Some((node.hash, node.expiry))
    }

    /// Iterates entries front to back.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    /// Iterates from the front, stopping at the first entry whose expiry is at or after
    /// `threshold`.
    pub fn iterate_front_while(
        &self,
        threshold: SystemTime,
    ) -> impl Iterator<Item = (u64, SystemTime)> + '_ {
        self.iter().take_while(move |(_, expiry)| *expiry < threshold)
    }

    fn unlink(&mut self, index: u32) -> (u64, SystemTime) {
        let (prev, next, hash, expiry) = {
            let node = &self.nodes[index as usize];
            (node.prev, node.next, node.hash, node.expiry)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }

        let node = &mut self.nodes[index as usize];
        node.live = false;
        node.prev = NIL;
        node.next = NIL;
        node.generation = node.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;

        (hash, expiry)
    }
}

pub struct Iter<'a> {
    queue: &'a ExpiryQueue,
    cursor: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (u64, SystemTime);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.queue.nodes[self.cursor as usize];
        self.cursor = node.next;
        Some((node.hash, node.expiry))
    }
}
