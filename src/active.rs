//! Index of the tokens active on the most recent frame.
//!
//! [`ActiveSet`] maps each graph state to its unique live token through a
//! bucketed hash table, while threading every entry onto an intrusive
//! insertion-order list. [`clear`](ActiveSet::clear) empties the table but
//! detaches the list as a snapshot: the expansion of the next frame walks
//! the snapshot entry by entry and returns each one's storage with
//! [`release`](ActiveSet::release) when done with it.

use crate::graph::StateId;
use crate::pool::TokenId;

/// Slab index of an [`ActiveSet`] entry; `NONE` is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ElemId(u32);

impl ElemId {
    pub const NONE: ElemId = ElemId(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

#[derive(Debug)]
struct Elem {
    key: StateId,
    val: TokenId,
    /// Next entry in this bucket's chain; doubles as the free-list link
    /// once the entry is released.
    bucket_next: ElemId,
    /// Next entry in insertion order.
    tail: ElemId,
}

#[derive(Debug)]
pub(crate) struct ActiveSet {
    buckets: Vec<ElemId>,
    elems: Vec<Elem>,
    free_head: ElemId,
    list_head: ElemId,
    list_tail: ElemId,
}

impl ActiveSet {
    pub fn new(num_buckets: usize) -> Self {
        assert!(num_buckets > 0);
        Self {
            buckets: vec![ElemId::NONE; num_buckets],
            elems: Vec::new(),
            free_head: ElemId::NONE,
            list_head: ElemId::NONE,
            list_tail: ElemId::NONE,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: StateId) -> usize {
        // Fibonacci mixing before the modulo so sequential state ids and
        // packed composed ids both spread across buckets.
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) % self.buckets.len() as u64) as usize
    }

    /// Grow the table to at least `num_buckets`, rehashing live entries.
    pub fn set_size(&mut self, num_buckets: usize) {
        if num_buckets <= self.buckets.len() {
            return;
        }
        self.buckets.clear();
        self.buckets.resize(num_buckets, ElemId::NONE);
        let mut e = self.list_head;
        while !e.is_none() {
            let bucket = self.bucket_of(self.elems[e.0 as usize].key);
            self.elems[e.0 as usize].bucket_next = self.buckets[bucket];
            self.buckets[bucket] = e;
            e = self.elems[e.0 as usize].tail;
        }
    }

    pub fn find(&self, key: StateId) -> Option<ElemId> {
        let mut e = self.buckets[self.bucket_of(key)];
        while !e.is_none() {
            let elem = &self.elems[e.0 as usize];
            if elem.key == key {
                return Some(e);
            }
            e = elem.bucket_next;
        }
        None
    }

    /// Insert a new entry. The key must not already be present.
    pub fn insert(&mut self, key: StateId, val: TokenId) {
        debug_assert!(self.find(key).is_none(), "duplicate active state {key}");
        let bucket = self.bucket_of(key);
        let elem = Elem {
            key,
            val,
            bucket_next: self.buckets[bucket],
            tail: ElemId::NONE,
        };
        let e = match self.free_head {
            ElemId::NONE => {
                let e = ElemId(self.elems.len() as u32);
                self.elems.push(elem);
                e
            }
            free => {
                self.free_head = self.elems[free.0 as usize].bucket_next;
                self.elems[free.0 as usize] = elem;
                free
            }
        };
        self.buckets[bucket] = e;
        if self.list_head.is_none() {
            self.list_head = e;
        } else {
            self.elems[self.list_tail.0 as usize].tail = e;
        }
        self.list_tail = e;
    }

    /// Empty the index and detach the entry list as a snapshot.
    ///
    /// Returns the head of the insertion-order list; the entries stay
    /// readable until individually [`release`](ActiveSet::release)d.
    pub fn clear(&mut self) -> ElemId {
        let head = self.list_head;
        self.buckets.fill(ElemId::NONE);
        self.list_head = ElemId::NONE;
        self.list_tail = ElemId::NONE;
        head
    }

    /// Return a snapshot entry's storage to the set.
    pub fn release(&mut self, e: ElemId) {
        self.elems[e.0 as usize].bucket_next = self.free_head;
        self.free_head = e;
    }

    pub fn key(&self, e: ElemId) -> StateId {
        self.elems[e.0 as usize].key
    }

    pub fn val(&self, e: ElemId) -> TokenId {
        self.elems[e.0 as usize].val
    }

    /// Next entry in insertion order (within the live list or a snapshot).
    pub fn tail(&self, e: ElemId) -> ElemId {
        self.elems[e.0 as usize].tail
    }

    pub fn head(&self) -> ElemId {
        self.list_head
    }

    /// Iterate the live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (StateId, TokenId)> + '_ {
        let mut e = self.list_head;
        std::iter::from_fn(move || {
            if e.is_none() {
                return None;
            }
            let elem = &self.elems[e.0 as usize];
            e = elem.tail;
            Some((elem.key, elem.val))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{LinkId, TokenPool};

    fn tok(pool: &mut TokenPool, cost: f32) -> TokenId {
        pool.new_token(cost, 0.0, LinkId::NONE, TokenId::NONE, TokenId::NONE)
    }

    #[test]
    fn finds_inserted_entries() {
        let mut pool = TokenPool::new();
        let mut set = ActiveSet::new(4);

        let t0 = tok(&mut pool, 0.0);
        let t1 = tok(&mut pool, 1.0);
        set.insert(10, t0);
        set.insert(7 << 32 | 10, t1); // composed id colliding on the low half

        assert_eq!(set.find(10).map(|e| set.val(e)), Some(t0));
        assert_eq!(set.find(7 << 32 | 10).map(|e| set.val(e)), Some(t1));
        assert!(set.find(11).is_none());
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let mut pool = TokenPool::new();
        let mut set = ActiveSet::new(2);

        for state in [5u64, 3, 9, 1] {
            let t = tok(&mut pool, state as f32);
            set.insert(state, t);
        }

        let mut keys = Vec::new();
        let mut e = set.clear();
        while !e.is_none() {
            keys.push(set.key(e));
            let next = set.tail(e);
            set.release(e);
            e = next;
        }

        assert_eq!(keys, vec![5, 3, 9, 1]);
        assert!(set.find(5).is_none());
        assert!(set.head().is_none());
    }

    #[test]
    fn released_entries_are_reused() {
        let mut pool = TokenPool::new();
        let mut set = ActiveSet::new(2);

        set.insert(1, tok(&mut pool, 0.0));
        let e = set.clear();
        set.release(e);

        set.insert(2, tok(&mut pool, 0.0));
        // The slab did not grow past the one slot.
        assert_eq!(set.iter().count(), 1);
        assert_eq!(set.find(2), Some(e));
    }

    #[test]
    fn rehash_keeps_live_entries_findable() {
        let mut pool = TokenPool::new();
        let mut set = ActiveSet::new(2);

        for state in 0..16u64 {
            let t = tok(&mut pool, state as f32);
            set.insert(state, t);
        }
        set.set_size(64);

        assert_eq!(set.num_buckets(), 64);
        for state in 0..16u64 {
            assert!(set.find(state).is_some(), "state {state} lost in rehash");
        }
        assert_eq!(set.iter().count(), 16);
    }
}
