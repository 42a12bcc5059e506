//! Value index: ordered lookup of entries by `(key, thread)`.
//!
//! An intrusive AVL tree whose links live in the pool slots, so inserting
//! and removing never allocate. Entries are ordered by key first, then by
//! thread, which keeps all bindings of one key adjacent for key deletion.
//!
//! AVL height stays below `1.45 * log2(n + 2)`, so the recursive insert and
//! remove paths are bounded to a few dozen frames even for a full 32-bit
//! pool.

use core::cmp::Ordering;

use crate::error::InvariantViolation;
use crate::pool::{Link, NodeHandle, NodePool};
use crate::registry::KeyId;
use crate::thread::ThreadId;

type Pair = (KeyId, ThreadId);

#[derive(Debug, Default)]
pub struct ValueIndex {
    root: Link,
    len: usize,
}

#[inline]
fn pair(pool: &NodePool, h: NodeHandle) -> Pair {
    let e = pool.get(h);
    (e.key, e.thread)
}

#[inline]
fn height(pool: &NodePool, link: Link) -> u8 {
    link.map_or(0, |h| pool.get(h).height)
}

fn update_height(pool: &mut NodePool, h: NodeHandle) {
    let e = pool.get(h);
    let hl = height(pool, e.left);
    let hr = height(pool, e.right);
    pool.get_mut(h).height = 1 + hl.max(hr);
}

fn balance_factor(pool: &NodePool, h: NodeHandle) -> i16 {
    let e = pool.get(h);
    i16::from(height(pool, e.left)) - i16::from(height(pool, e.right))
}

fn rotate_right(pool: &mut NodePool, h: NodeHandle) -> NodeHandle {
    let Some(l) = pool.get(h).left else {
        return h;
    };
    pool.get_mut(h).left = pool.get(l).right;
    pool.get_mut(l).right = Some(h);
    update_height(pool, h);
    update_height(pool, l);
    l
}

fn rotate_left(pool: &mut NodePool, h: NodeHandle) -> NodeHandle {
    let Some(r) = pool.get(h).right else {
        return h;
    };
    pool.get_mut(h).right = pool.get(r).left;
    pool.get_mut(r).left = Some(h);
    update_height(pool, h);
    update_height(pool, r);
    r
}

/// Restore the AVL property at `h`; returns the new subtree root.
fn rebalance(pool: &mut NodePool, h: NodeHandle) -> NodeHandle {
    update_height(pool, h);
    let bf = balance_factor(pool, h);
    if bf > 1 {
        if let Some(l) = pool.get(h).left
            && balance_factor(pool, l) < 0
        {
            let l = rotate_left(pool, l);
            pool.get_mut(h).left = Some(l);
        }
        return rotate_right(pool, h);
    }
    if bf < -1 {
        if let Some(r) = pool.get(h).right
            && balance_factor(pool, r) > 0
        {
            let r = rotate_right(pool, r);
            pool.get_mut(h).right = Some(r);
        }
        return rotate_left(pool, h);
    }
    h
}

/// Links nothing on `Err`: the duplicate check happens before any rebalancing.
fn insert_at(pool: &mut NodePool, link: Link, node: NodeHandle) -> Result<NodeHandle, NodeHandle> {
    let Some(h) = link else {
        return Ok(node);
    };
    match pair(pool, node).cmp(&pair(pool, h)) {
        Ordering::Less => {
            let left = pool.get(h).left;
            let l = insert_at(pool, left, node)?;
            pool.get_mut(h).left = Some(l);
        }
        Ordering::Greater => {
            let right = pool.get(h).right;
            let r = insert_at(pool, right, node)?;
            pool.get_mut(h).right = Some(r);
        }
        Ordering::Equal => return Err(h),
    }
    Ok(rebalance(pool, h))
}

/// Detach the minimum of the subtree at `h`: `(new subtree root, minimum)`.
fn remove_min(pool: &mut NodePool, h: NodeHandle) -> (Link, NodeHandle) {
    let Some(l) = pool.get(h).left else {
        return (pool.get(h).right, h);
    };
    let (new_left, min) = remove_min(pool, l);
    pool.get_mut(h).left = new_left;
    (Some(rebalance(pool, h)), min)
}

fn remove_at(pool: &mut NodePool, link: Link, target: Pair) -> (Link, Option<NodeHandle>) {
    let Some(h) = link else {
        return (None, None);
    };
    match target.cmp(&pair(pool, h)) {
        Ordering::Less => {
            let left = pool.get(h).left;
            let (l, removed) = remove_at(pool, left, target);
            if removed.is_none() {
                return (Some(h), None);
            }
            pool.get_mut(h).left = l;
            (Some(rebalance(pool, h)), removed)
        }
        Ordering::Greater => {
            let right = pool.get(h).right;
            let (r, removed) = remove_at(pool, right, target);
            if removed.is_none() {
                return (Some(h), None);
            }
            pool.get_mut(h).right = r;
            (Some(rebalance(pool, h)), removed)
        }
        Ordering::Equal => {
            let e = pool.get(h);
            let replacement = match (e.left, e.right) {
                (None, child) | (child, None) => child,
                (Some(l), Some(r)) => {
                    let (new_right, min) = remove_min(pool, r);
                    let succ = pool.get_mut(min);
                    succ.left = Some(l);
                    succ.right = new_right;
                    Some(rebalance(pool, min))
                }
            };
            (replacement, Some(h))
        }
    }
}

impl ValueIndex {
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn find(&self, pool: &NodePool, key: KeyId, thread: ThreadId) -> Option<NodeHandle> {
        let target = (key, thread);
        let mut cur = self.root;
        while let Some(h) = cur {
            let e = pool.get(h);
            cur = match target.cmp(&(e.key, e.thread)) {
                Ordering::Less => e.left,
                Ordering::Greater => e.right,
                Ordering::Equal => return Some(h),
            };
        }
        None
    }

    /// Link a freshly acquired entry.
    ///
    /// Fails with the handle of the existing entry when the pair is already
    /// indexed; the tree is left untouched in that case.
    pub fn insert(&mut self, pool: &mut NodePool, node: NodeHandle) -> Result<(), NodeHandle> {
        let root = insert_at(pool, self.root, node)?;
        self.root = Some(root);
        self.len += 1;
        Ok(())
    }

    /// Unlink the entry for `(key, thread)`; the slot stays allocated.
    pub fn remove(
        &mut self,
        pool: &mut NodePool,
        key: KeyId,
        thread: ThreadId,
    ) -> Option<NodeHandle> {
        let (root, removed) = remove_at(pool, self.root, (key, thread));
        let h = removed?;
        self.root = root;
        self.len -= 1;
        let e = pool.get_mut(h);
        e.left = None;
        e.right = None;
        e.height = 1;
        Some(h)
    }

    /// Lowest-thread entry bound to `key`.
    #[must_use]
    pub fn first_for_key(&self, pool: &NodePool, key: KeyId) -> Option<NodeHandle> {
        let mut best = None;
        let mut cur = self.root;
        while let Some(h) = cur {
            let e = pool.get(h);
            cur = match e.key.cmp(&key) {
                Ordering::Less => e.right,
                Ordering::Greater => e.left,
                Ordering::Equal => {
                    best = Some(h);
                    e.left
                }
            };
        }
        best
    }

    /// Visit entries in `(key, thread)` order.
    pub fn for_each<F: FnMut(NodeHandle)>(&self, pool: &NodePool, mut f: F) {
        fn walk<F: FnMut(NodeHandle)>(pool: &NodePool, link: Link, f: &mut F) {
            if let Some(h) = link {
                walk(pool, pool.get(h).left, f);
                f(h);
                walk(pool, pool.get(h).right, f);
            }
        }
        walk(pool, self.root, &mut f);
    }

    /// Verify ordering, AVL balance and stored heights.
    pub fn check(&self, pool: &NodePool) -> Result<(), InvariantViolation> {
        let (_, count) = check_subtree(pool, self.root, None, None)?;
        if count != self.len {
            return Err(InvariantViolation::IndexCount {
                index: self.len,
                pool: count,
            });
        }
        Ok(())
    }
}

fn check_subtree(
    pool: &NodePool,
    link: Link,
    lo: Option<Pair>,
    hi: Option<Pair>,
) -> Result<(u8, usize), InvariantViolation> {
    let Some(h) = link else {
        return Ok((0, 0));
    };
    let e = pool.get(h);
    let p = (e.key, e.thread);
    if !e.live || lo.is_some_and(|lo| p <= lo) || hi.is_some_and(|hi| p >= hi) {
        return Err(InvariantViolation::IndexOrder { node: h.as_u32() });
    }
    let (hl, cl) = check_subtree(pool, e.left, lo, Some(p))?;
    let (hr, cr) = check_subtree(pool, e.right, Some(p), hi)?;
    if hl.abs_diff(hr) > 1 || e.height != 1 + hl.max(hr) {
        return Err(InvariantViolation::IndexBalance {
            node: h.as_u32(),
            left: hl,
            right: hr,
        });
    }
    Ok((e.height, cl + cr + 1))
}
