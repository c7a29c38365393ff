//! Generation-checked arena with an ordered membership index.
//!
//! Slots are reused through a free list; every reuse bumps the slot's
//! generation, so a [`Handle`] kept across a removal resolves to `None`
//! instead of aliasing the newcomer. Live slots are also threaded on a
//! doubly linked list in insertion order, giving O(1) insert/remove and a
//! stable iteration order.

use std::fmt;

/// Stable reference to a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) Handle);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

typed_handle!(
    /// Identifies a control-channel connection.
    ConnectionId
);
typed_handle!(
    /// Identifies a WebSocket client.
    WsClientId
);
typed_handle!(
    /// Identifies a registered descriptor watch.
    WatchId
);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Arena of `T` addressed by [`Handle`].
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Insert a value built from its own handle; appended at the end of the order.
    pub fn insert_with(&mut self, build: impl FnOnce(Handle) -> T) -> Handle {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                    prev: None,
                    next: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let handle = Handle {
            index,
            generation: self.slots[index as usize].generation,
        };
        let value = build(handle);

        let old_tail = self.tail;
        {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            slot.prev = old_tail;
            slot.next = None;
        }
        match old_tail {
            Some(t) => self.slots[t as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        handle
    }

    /// Insert a value; appended at the end of the order.
    pub fn insert(&mut self, value: T) -> Handle {
        self.insert_with(|_| value)
    }

    /// Remove an entry. Stale or already-removed handles return `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        let (prev, next) = (slot.prev.take(), slot.next.take());
        slot.generation = slot.generation.wrapping_add(1);

        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.free.push(handle.index);
        self.len -= 1;
        value
    }

    /// Shared access to a live entry.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Mutable access to a live entry.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Whether `handle` refers to a live entry.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Snapshot of live handles in insertion order.
    ///
    /// Safe to hold while the pool is mutated; resolve each handle again
    /// before use.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            pool: self,
            cursor: self.head,
        }
    }
}

/// Ordered iterator over a [`Pool`].
#[derive(Debug)]
pub struct Iter<'a, T> {
    pool: &'a Pool<T>,
    cursor: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.pool.slots[index as usize];
        self.cursor = slot.next;
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        slot.value.as_ref().map(|v| (handle, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_follows_insertion_order() {
        let mut pool = Pool::new();
        let a = pool.insert("a");
        let b = pool.insert("b");
        let c = pool.insert("c");
        assert_eq!(pool.handles(), vec![a, b, c]);

        pool.remove(b);
        let names: Vec<_> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let mut pool = Pool::new();
        let old = pool.insert(1);
        assert_eq!(pool.remove(old), Some(1));

        let new = pool.insert(2);
        assert_ne!(old, new);
        assert_eq!(pool.get(old), None);
        assert_eq!(pool.get(new), Some(&2));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut pool = Pool::new();
        let h = pool.insert(7);
        assert_eq!(pool.remove(h), Some(7));
        assert_eq!(pool.remove(h), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn reused_slot_moves_to_the_tail() {
        let mut pool = Pool::new();
        let a = pool.insert('a');
        let b = pool.insert('b');
        pool.remove(a);
        let c = pool.insert('c');
        assert_eq!(pool.handles(), vec![b, c]);
    }

    #[test]
    fn insert_with_sees_own_handle() {
        let mut pool = Pool::new();
        let h = pool.insert_with(|h| h);
        assert_eq!(pool.get(h), Some(&h));
    }

    #[test]
    fn removing_head_and_tail_keeps_links_consistent() {
        let mut pool = Pool::new();
        let hs: Vec<_> = (0..5).map(|i| pool.insert(i)).collect();
        pool.remove(hs[0]);
        pool.remove(hs[4]);
        pool.remove(hs[2]);
        let vals: Vec<_> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(vals, vec![1, 3]);
        pool.insert(9);
        let vals: Vec<_> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(vals, vec![1, 3, 9]);
    }
}
