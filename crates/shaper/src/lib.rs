//! Hierarchical token-bucket traffic shaper.
//!
//! A [`TokenShaper`] is a rooted tree of buckets, inspired by the HTB
//! queuing discipline. Each bucket is guaranteed a token rate (a
//! fraction of its parent) and may borrow up to its ceiling when the
//! parent has spare tokens. Items that cannot be admitted are queued
//! per bucket and dequeued fairly: children first, round-robin via a
//! rotating cursor, then the bucket's own FIFO.
//!
//! The shaper only decides *whether* a task may run; callers run the
//! task themselves after a successful [`TokenShaper::get`] and must
//! return the tokens with [`TokenShaper::put`] when the task
//! finishes.
//!
//! Buckets live in an index arena; [`BucketId`]s stay valid for the
//! shaper's lifetime (destroyed buckets leave a tombstone). Token
//! accounting uses atomics with a compare-and-swap fast path, a single
//! mutex serialises the borrow slow path, and structural changes hold
//! the tree's write lock.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Mutation result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaperError {
    /// Rate limit is either too low or too high.
    RateLimitOverflow,
    /// Ceil limit is either too low or too high.
    CeilLimitOverflow,
    /// The name already exists somewhere else in the tree.
    NameConflict,
    /// The operation is not valid on the root bucket (or the bucket
    /// is gone).
    InvalidChildNode,
}

impl std::fmt::Display for ShaperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShaperError::RateLimitOverflow => "rate limit overflow",
            ShaperError::CeilLimitOverflow => "ceil limit overflow",
            ShaperError::NameConflict => "name conflict",
            ShaperError::InvalidChildNode => "invalid child node",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ShaperError {}

pub type BucketId = usize;

/// Called with every item dropped by the queue-timeout sweep.
pub type TimeoutHandler<T> = Box<dyn Fn(T) + Send + Sync>;

const ROOT: BucketId = 0;
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(50);

struct QueueItem<T> {
    value: T,
    ctime: Instant,
}

struct Bucket<T> {
    name: String,
    parent: Option<BucketId>,
    children: Vec<BucketId>,
    dead: bool,

    /// Fraction of the parent's rate this bucket is guaranteed.
    rate: f64,
    /// Fraction of the parent's ceiling this bucket may borrow up to.
    ceil: f64,
    /// Guaranteed tokens, computed from the ancestors.
    token_rate: usize,
    /// Maximum tokens including borrowed ones.
    token_ceil: usize,

    actual: AtomicUsize,
    queued: AtomicUsize,
    dropped: AtomicU64,
    queue: Mutex<VecDeque<QueueItem<T>>>,
    queue_timeout: Duration,
    /// Round-robin dequeue cursor over `children`.
    cursor: AtomicUsize,
}

impl<T> Bucket<T> {
    fn new(
        name: &str,
        parent: Option<BucketId>,
        rate: f64,
        ceil: f64,
        token_rate: usize,
        token_ceil: usize,
    ) -> Self {
        Bucket {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            dead: false,
            rate,
            ceil,
            token_rate,
            token_ceil,
            actual: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            cursor: AtomicUsize::new(0),
        }
    }

    fn over_rate(&self) -> usize {
        self.actual
            .load(Ordering::Relaxed)
            .saturating_sub(self.token_rate)
    }
}

struct Tree<T> {
    buckets: Vec<Bucket<T>>,
}

impl<T> Tree<T> {
    fn bucket(&self, id: BucketId) -> Option<&Bucket<T>> {
        self.buckets.get(id).filter(|b| !b.dead)
    }

    fn child_token_rate(&self, id: BucketId) -> usize {
        self.buckets[id]
            .children
            .iter()
            .map(|&c| self.buckets[c].token_rate)
            .sum()
    }

    fn actual_child_over_rate(&self, id: BucketId) -> usize {
        self.buckets[id]
            .children
            .iter()
            .map(|&c| self.buckets[c].over_rate())
            .sum()
    }

    fn child_rate_fraction(&self, id: BucketId) -> f64 {
        self.buckets[id]
            .children
            .iter()
            .map(|&c| self.buckets[c].rate)
            .sum()
    }

    fn find(&self, name: &str) -> Option<BucketId> {
        self.buckets
            .iter()
            .position(|b| !b.dead && b.name == name)
    }

    /// Recomputes token counts below `id` after a reconfiguration.
    fn update_subtree(&mut self, id: BucketId) {
        let mut stack = self.buckets[id].children.clone();
        while let Some(child) = stack.pop() {
            let parent = self.buckets[child].parent.unwrap_or(ROOT);
            let parent_rate = self.buckets[parent].token_rate;
            let parent_ceil = self.buckets[parent].token_ceil;
            let bucket = &mut self.buckets[child];
            bucket.token_rate = (parent_rate as f64 * bucket.rate) as usize;
            bucket.token_ceil = (parent_ceil as f64 * bucket.ceil) as usize;
            stack.extend(self.buckets[child].children.iter().copied());
        }
    }

    /// Whether `id` can take `n` more tokens from its guaranteed
    /// pool: neither its own load nor its children's reservations may
    /// exceed the token rate.
    fn fast_path_fits(&self, id: BucketId, n: usize) -> bool {
        let bucket = &self.buckets[id];
        let actual = bucket.actual.load(Ordering::Relaxed);
        let reserved = self.child_token_rate(id);
        let overshoot = self.actual_child_over_rate(id);
        actual.max(reserved + overshoot) + n <= bucket.token_rate
    }
}

/// Aggregated snapshot of one bucket (and its children), for JSON
/// export.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub name: String,
    pub rate: f64,
    pub ceil: f64,
    #[serde(rename = "token-rate")]
    pub token_rate: usize,
    #[serde(rename = "token-ceil")]
    pub token_ceil: usize,
    #[serde(rename = "actual-rate")]
    pub actual_rate: usize,
    pub queued: usize,
    pub dropped: u64,
    pub children: Vec<BucketStats>,
}

pub struct TokenShaper<T> {
    tree: RwLock<Tree<T>>,
    /// Serialises borrow decisions. Never acquired while holding the
    /// tree write lock.
    lock: Mutex<()>,
    on_timeout: Mutex<Option<TimeoutHandler<T>>>,
}

impl<T> TokenShaper<T> {
    /// A shaper whose root holds `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        TokenShaper {
            tree: RwLock::new(Tree {
                buckets: vec![Bucket::new("root", None, 1.0, 1.0, capacity, capacity)],
            }),
            lock: Mutex::new(()),
            on_timeout: Mutex::new(None),
        }
    }

    pub fn root(&self) -> BucketId {
        ROOT
    }

    pub fn capacity(&self) -> usize {
        self.tree.read().unwrap().buckets[ROOT].token_rate
    }

    /// Re-seeds the root capacity, recomputing every bucket's token
    /// counts. Structural mutations hold the tree write lock, which
    /// excludes every token-path reader including the borrow slow
    /// path.
    pub fn resize(&self, capacity: usize) {
        let mut tree = self.tree.write().unwrap();
        if tree.buckets[ROOT].token_rate == capacity {
            return;
        }
        tree.buckets[ROOT].token_rate = capacity;
        tree.buckets[ROOT].token_ceil = capacity;
        tree.update_subtree(ROOT);
        debug!(capacity, "shaper resized");
    }

    pub fn set_timeout_handler(&self, handler: TimeoutHandler<T>) {
        *self.on_timeout.lock().unwrap() = Some(handler);
    }

    pub fn find(&self, name: &str) -> Option<BucketId> {
        self.tree.read().unwrap().find(name)
    }

    pub fn name(&self, id: BucketId) -> Option<String> {
        self.tree
            .read()
            .unwrap()
            .bucket(id)
            .map(|b| b.name.clone())
    }

    pub fn token_rate(&self, id: BucketId) -> usize {
        self.tree
            .read()
            .unwrap()
            .bucket(id)
            .map(|b| b.token_rate)
            .unwrap_or(0)
    }

    pub fn token_ceil(&self, id: BucketId) -> usize {
        self.tree
            .read()
            .unwrap()
            .bucket(id)
            .map(|b| b.token_ceil)
            .unwrap_or(0)
    }

    pub fn actual_rate(&self, id: BucketId) -> usize {
        self.tree
            .read()
            .unwrap()
            .bucket(id)
            .map(|b| b.actual.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn queued(&self, id: BucketId) -> usize {
        self.tree
            .read()
            .unwrap()
            .bucket(id)
            .map(|b| b.queued.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn dropped(&self, id: BucketId) -> u64 {
        self.tree
            .read()
            .unwrap()
            .bucket(id)
            .map(|b| b.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn queue_timeout(&self, id: BucketId) -> Duration {
        self.tree
            .read()
            .unwrap()
            .bucket(id)
            .map(|b| b.queue_timeout)
            .unwrap_or(DEFAULT_QUEUE_TIMEOUT)
    }

    pub fn set_queue_timeout(&self, id: BucketId, timeout: Duration) {
        let mut tree = self.tree.write().unwrap();
        if let Some(bucket) = tree.buckets.get_mut(id).filter(|b| !b.dead) {
            bucket.queue_timeout = timeout;
        }
    }

    /// Creates a child bucket of `parent`. The child is guaranteed
    /// `rate` of its parent and may borrow up to `ceil` of it;
    /// `0 <= rate <= ceil <= 1`, and the sum of sibling rates must
    /// not exceed 1.
    pub fn create_child(
        &self,
        parent: BucketId,
        name: &str,
        rate: f64,
        ceil: f64,
    ) -> Result<BucketId, ShaperError> {
        let mut tree = self.tree.write().unwrap();

        if tree.bucket(parent).is_none() {
            return Err(ShaperError::InvalidChildNode);
        }
        if !(0.0..=1.0).contains(&rate) || rate + tree.child_rate_fraction(parent) > 1.0 {
            return Err(ShaperError::RateLimitOverflow);
        }
        if ceil < rate || ceil > 1.0 {
            return Err(ShaperError::CeilLimitOverflow);
        }
        if tree.find(name).is_some() {
            return Err(ShaperError::NameConflict);
        }

        let token_rate = (tree.buckets[parent].token_rate as f64 * rate) as usize;
        let token_ceil = (tree.buckets[parent].token_ceil as f64 * ceil) as usize;
        tree.buckets.push(Bucket::new(
            name,
            Some(parent),
            rate,
            ceil,
            token_rate,
            token_ceil,
        ));
        let id = tree.buckets.len() - 1;
        tree.buckets[parent].children.push(id);
        debug!(name, rate, ceil, token_rate, token_ceil, "bucket created");
        Ok(id)
    }

    /// Removes a bucket and its subtree. Queued items are dropped
    /// through the timeout handler. The root cannot be destroyed.
    pub fn destroy(&self, id: BucketId) -> Result<(), ShaperError> {
        let mut victims = Vec::new();
        {
            let mut tree = self.tree.write().unwrap();
            if id == ROOT || tree.bucket(id).is_none() {
                return Err(ShaperError::InvalidChildNode);
            }

            let parent = tree.buckets[id].parent.unwrap_or(ROOT);
            tree.buckets[parent].children.retain(|&c| c != id);

            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                stack.extend(tree.buckets[current].children.iter().copied());
                tree.buckets[current].dead = true;
                tree.buckets[current].children.clear();
                let mut queue = tree.buckets[current].queue.lock().unwrap();
                victims.extend(queue.drain(..).map(|item| item.value));
            }
        }

        let handler = self.on_timeout.lock().unwrap();
        if let Some(handler) = handler.as_ref() {
            for victim in victims {
                handler(victim);
            }
        }
        Ok(())
    }

    pub fn set_rate(&self, id: BucketId, rate: f64) -> Result<(), ShaperError> {
        let mut tree = self.tree.write().unwrap();
        let Some(bucket) = tree.bucket(id) else {
            return Err(ShaperError::InvalidChildNode);
        };
        let Some(parent) = bucket.parent else {
            return Err(ShaperError::InvalidChildNode);
        };
        if !(0.0..=1.0).contains(&rate) || rate > bucket.ceil {
            return Err(ShaperError::RateLimitOverflow);
        }

        let parent_rate = tree.buckets[parent].token_rate;
        let bucket = &mut tree.buckets[id];
        bucket.rate = rate;
        bucket.token_rate = (parent_rate as f64 * rate) as usize;
        tree.update_subtree(id);
        Ok(())
    }

    pub fn set_ceil(&self, id: BucketId, ceil: f64) -> Result<(), ShaperError> {
        let mut tree = self.tree.write().unwrap();
        let Some(bucket) = tree.bucket(id) else {
            return Err(ShaperError::InvalidChildNode);
        };
        let Some(parent) = bucket.parent else {
            return Err(ShaperError::InvalidChildNode);
        };
        if ceil < bucket.rate || ceil > 1.0 {
            return Err(ShaperError::CeilLimitOverflow);
        }

        let parent_ceil = tree.buckets[parent].token_ceil;
        let bucket = &mut tree.buckets[id];
        bucket.ceil = ceil;
        bucket.token_ceil = (parent_ceil as f64 * ceil) as usize;
        tree.update_subtree(id);
        Ok(())
    }

    pub fn set_name(&self, id: BucketId, name: &str) -> Result<(), ShaperError> {
        let mut tree = self.tree.write().unwrap();
        if tree.bucket(id).is_none() {
            return Err(ShaperError::InvalidChildNode);
        }
        if tree.find(name).is_some_and(|existing| existing != id) {
            return Err(ShaperError::NameConflict);
        }
        tree.buckets[id].name = name.to_string();
        Ok(())
    }

    /// Tries to allocate `n` tokens on `id`. Returns `n` on success
    /// (the tokens are charged to the bucket and every ancestor) or 0
    /// when neither the guaranteed pool nor borrowing within the
    /// ceiling can satisfy the request.
    pub fn get(&self, id: BucketId, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let tree = self.tree.read().unwrap();
        if tree.bucket(id).is_none() {
            return 0;
        }
        self.get_with_tree(&tree, id, n)
    }

    /// Returns `n` tokens to `id` and all its ancestors.
    pub fn put(&self, id: BucketId, n: usize) {
        let tree = self.tree.read().unwrap();
        if tree.bucket(id).is_none() {
            return;
        }
        self.put_with_tree(&tree, id, n);
    }

    /// Admits `item` if `cost` tokens are available, queueing it
    /// otherwise. Returns true when the caller may run the task right
    /// away.
    pub fn send(&self, id: BucketId, item: T, cost: usize) -> bool {
        if self.get(id, cost) == cost && cost > 0 {
            return true;
        }
        self.enqueue(id, item);
        false
    }

    /// Appends an item to the bucket's FIFO. Returns the deadline at
    /// which the new head would time out, for the host's timer.
    pub fn enqueue(&self, id: BucketId, item: T) -> Option<Instant> {
        let tree = self.tree.read().unwrap();
        let bucket = tree.bucket(id)?;
        let mut queue = bucket.queue.lock().unwrap();
        queue.push_back(QueueItem {
            value: item,
            ctime: Instant::now(),
        });
        bucket.queued.fetch_add(1, Ordering::Relaxed);
        queue.front().map(|head| head.ctime + bucket.queue_timeout)
    }

    /// Fairly picks a queued item that the tree has a token for:
    /// children take precedence, round-robin through the cursor, then
    /// the bucket's own FIFO (charged one token).
    pub fn dequeue(&self) -> Option<T> {
        let tree = self.tree.read().unwrap();
        self.dequeue_from(&tree, ROOT)
    }

    pub fn dequeue_at(&self, id: BucketId) -> Option<T> {
        let tree = self.tree.read().unwrap();
        tree.bucket(id)?;
        self.dequeue_from(&tree, id)
    }

    fn dequeue_from(&self, tree: &Tree<T>, id: BucketId) -> Option<T> {
        let child_count = tree.buckets[id].children.len();
        for _ in 0..child_count {
            let cursor = tree.buckets[id]
                .cursor
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |c| {
                    Some(if c == 0 { child_count - 1 } else { (c - 1) % child_count })
                })
                .map(|previous| {
                    if previous == 0 {
                        child_count - 1
                    } else {
                        (previous - 1) % child_count
                    }
                })
                .unwrap_or(0);

            let child = tree.buckets[id].children[cursor];
            if let Some(item) = self.dequeue_from(tree, child) {
                return Some(item);
            }
        }

        // nothing in the children; try the local queue if a token is
        // available
        let bucket = &tree.buckets[id];
        {
            let queue = bucket.queue.lock().unwrap();
            if queue.is_empty() {
                return None;
            }
        }
        if self.get_with_tree(tree, id, 1) == 0 {
            return None;
        }
        let mut queue = bucket.queue.lock().unwrap();
        match queue.pop_front() {
            Some(item) => {
                bucket.queued.fetch_sub(1, Ordering::Relaxed);
                Some(item.value)
            }
            None => {
                // raced with a timeout sweep; give the token back
                drop(queue);
                self.put_with_tree(tree, id, 1);
                None
            }
        }
    }

    /// Drops every queued item whose age exceeds its bucket's
    /// timeout, invoking the timeout handler for each. Returns the
    /// earliest deadline still pending, for re-arming the host timer.
    pub fn run_timeouts(&self, now: Instant) -> Option<Instant> {
        let mut expired = Vec::new();
        let mut next_deadline: Option<Instant> = None;
        {
            let tree = self.tree.read().unwrap();
            for bucket in tree.buckets.iter().filter(|b| !b.dead) {
                let mut queue = bucket.queue.lock().unwrap();
                while let Some(head) = queue.front() {
                    let deadline = head.ctime + bucket.queue_timeout;
                    if deadline <= now {
                        let item = queue.pop_front().unwrap();
                        bucket.queued.fetch_sub(1, Ordering::Relaxed);
                        bucket.dropped.fetch_add(1, Ordering::Relaxed);
                        expired.push(item.value);
                    } else {
                        next_deadline = Some(match next_deadline {
                            Some(current) => current.min(deadline),
                            None => deadline,
                        });
                        break;
                    }
                }
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "queued items timed out");
            let handler = self.on_timeout.lock().unwrap();
            if let Some(handler) = handler.as_ref() {
                for item in expired {
                    handler(item);
                }
            }
        }
        next_deadline
    }

    /// Snapshot of the whole tree.
    pub fn stats(&self) -> BucketStats {
        let tree = self.tree.read().unwrap();
        self.stats_of(&tree, ROOT)
    }

    /// Snapshot rendered as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.stats()).unwrap_or_else(|_| "{}".to_string())
    }

    fn stats_of(&self, tree: &Tree<T>, id: BucketId) -> BucketStats {
        let bucket = &tree.buckets[id];
        BucketStats {
            name: bucket.name.clone(),
            rate: bucket.rate,
            ceil: bucket.ceil,
            token_rate: bucket.token_rate,
            token_ceil: bucket.token_ceil,
            actual_rate: bucket.actual.load(Ordering::Relaxed),
            queued: bucket.queued.load(Ordering::Relaxed),
            dropped: bucket.dropped.load(Ordering::Relaxed),
            children: bucket
                .children
                .iter()
                .map(|&c| self.stats_of(tree, c))
                .collect(),
        }
    }

    // get/put against an already-held tree guard

    fn get_with_tree(&self, tree: &Tree<T>, id: BucketId, n: usize) -> usize {
        // optimistic fast path against the guaranteed pool
        loop {
            let bucket = &tree.buckets[id];
            let actual = bucket.actual.load(Ordering::Relaxed);
            let reserved = tree.child_token_rate(id);
            let overshoot = tree.actual_child_over_rate(id);
            if actual.max(reserved + overshoot) + n > bucket.token_rate {
                break;
            }
            if bucket
                .actual
                .compare_exchange(actual, actual + n, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let mut current = bucket.parent;
            while let Some(p) = current {
                tree.buckets[p].actual.fetch_add(n, Ordering::AcqRel);
                current = tree.buckets[p].parent;
            }
            trace!(bucket = %bucket.name, n, "tokens granted");
            return n;
        }

        // borrow slow path: walk up until an ancestor has guaranteed
        // room; everything below it must stay within its ceiling
        let _guard = self.lock.lock().unwrap();
        let mut chain = Vec::new();
        let mut current = id;
        let granted = loop {
            if tree.fast_path_fits(current, n) {
                chain.push(current);
                break true;
            }
            let bucket = &tree.buckets[current];
            if bucket.actual.load(Ordering::Relaxed) + n > bucket.token_ceil {
                break false;
            }
            chain.push(current);
            match bucket.parent {
                Some(parent) => current = parent,
                None => break false,
            }
        };
        if !granted {
            trace!(n, "token request denied");
            return 0;
        }
        // charge the chain and every ancestor above it
        for &node in &chain {
            tree.buckets[node].actual.fetch_add(n, Ordering::AcqRel);
        }
        let mut current = tree.buckets[*chain.last().unwrap()].parent;
        while let Some(p) = current {
            tree.buckets[p].actual.fetch_add(n, Ordering::AcqRel);
            current = tree.buckets[p].parent;
        }
        n
    }

    fn put_with_tree(&self, tree: &Tree<T>, id: BucketId, n: usize) {
        let mut current = Some(id);
        while let Some(node) = current {
            let bucket = &tree.buckets[node];
            let mut value = bucket.actual.load(Ordering::Relaxed);
            loop {
                let next = value.saturating_sub(n);
                match bucket.actual.compare_exchange(
                    value,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => value = observed,
                }
            }
            current = bucket.parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_root_get_and_put() {
        let shaper: TokenShaper<u32> = TokenShaper::new(10);
        assert_eq!(shaper.get(shaper.root(), 4), 4);
        assert_eq!(shaper.actual_rate(shaper.root()), 4);
        assert_eq!(shaper.get(shaper.root(), 7), 0);
        shaper.put(shaper.root(), 4);
        assert_eq!(shaper.actual_rate(shaper.root()), 0);
        assert_eq!(shaper.get(shaper.root(), 10), 10);
    }

    #[test]
    fn test_child_token_math() {
        let shaper: TokenShaper<u32> = TokenShaper::new(100);
        let upload = shaper.create_child(shaper.root(), "upload", 0.5, 1.0).unwrap();
        let bulk = shaper.create_child(upload, "bulk", 0.5, 0.8).unwrap();

        assert_eq!(shaper.token_rate(upload), 50);
        assert_eq!(shaper.token_ceil(upload), 100);
        assert_eq!(shaper.token_rate(bulk), 25);
        assert_eq!(shaper.token_ceil(bulk), 80);
    }

    #[test]
    fn test_get_propagates_to_ancestors() {
        let shaper: TokenShaper<u32> = TokenShaper::new(100);
        let a = shaper.create_child(shaper.root(), "a", 0.5, 0.5).unwrap();
        let aa = shaper.create_child(a, "aa", 0.5, 1.0).unwrap();

        assert_eq!(shaper.get(aa, 10), 10);
        assert_eq!(shaper.actual_rate(aa), 10);
        assert_eq!(shaper.actual_rate(a), 10);
        assert_eq!(shaper.actual_rate(shaper.root()), 10);

        shaper.put(aa, 10);
        assert_eq!(shaper.actual_rate(aa), 0);
        assert_eq!(shaper.actual_rate(a), 0);
        assert_eq!(shaper.actual_rate(shaper.root()), 0);
    }

    #[test]
    fn test_parent_invariant_holds() {
        let shaper: TokenShaper<u32> = TokenShaper::new(100);
        let a = shaper.create_child(shaper.root(), "a", 0.4, 1.0).unwrap();
        let b = shaper.create_child(shaper.root(), "b", 0.4, 1.0).unwrap();

        shaper.get(a, 20);
        shaper.get(b, 30);
        // actualRate(parent) >= sum of children's actualRate
        assert!(shaper.actual_rate(shaper.root()) >= shaper.actual_rate(a) + shaper.actual_rate(b));
    }

    #[test]
    fn test_borrowing_up_to_ceiling() {
        let shaper: TokenShaper<u32> = TokenShaper::new(10);
        let a = shaper.create_child(shaper.root(), "a", 0.2, 0.8).unwrap();

        // guaranteed 2, ceiling 8: borrowing covers the difference
        assert_eq!(shaper.get(a, 8), 8);
        assert_eq!(shaper.actual_rate(a), 8);
        assert_eq!(shaper.actual_rate(shaper.root()), 8);

        // above the ceiling nothing is granted
        assert_eq!(shaper.get(a, 1), 0);
    }

    #[test]
    fn test_borrowing_respects_sibling_reservations() {
        let shaper: TokenShaper<u32> = TokenShaper::new(10);
        let a = shaper.create_child(shaper.root(), "a", 0.5, 1.0).unwrap();
        let _b = shaper.create_child(shaper.root(), "b", 0.5, 0.5).unwrap();

        // the root reserves 5+5 for its children, so a cannot borrow
        // beyond its own guarantee
        assert_eq!(shaper.get(a, 5), 5);
        assert_eq!(shaper.get(a, 1), 0);
    }

    #[test]
    fn test_create_child_validation() {
        let shaper: TokenShaper<u32> = TokenShaper::new(10);
        shaper.create_child(shaper.root(), "a", 0.6, 1.0).unwrap();

        assert_eq!(
            shaper.create_child(shaper.root(), "b", 0.5, 1.0),
            Err(ShaperError::RateLimitOverflow)
        );
        assert_eq!(
            shaper.create_child(shaper.root(), "b", 0.3, 0.2),
            Err(ShaperError::CeilLimitOverflow)
        );
        assert_eq!(
            shaper.create_child(shaper.root(), "a", 0.1, 0.5),
            Err(ShaperError::NameConflict)
        );
    }

    #[test]
    fn test_reconfiguration() {
        let shaper: TokenShaper<u32> = TokenShaper::new(100);
        let a = shaper.create_child(shaper.root(), "a", 0.5, 0.5).unwrap();
        let aa = shaper.create_child(a, "aa", 0.5, 1.0).unwrap();
        assert_eq!(shaper.token_rate(aa), 25);

        shaper.set_rate(a, 0.2).unwrap();
        assert_eq!(shaper.token_rate(a), 20);
        assert_eq!(shaper.token_rate(aa), 10);

        // root cannot be reconfigured
        assert_eq!(
            shaper.set_rate(shaper.root(), 0.5),
            Err(ShaperError::InvalidChildNode)
        );
        // rate above ceil fraction
        assert_eq!(shaper.set_rate(a, 0.9), Err(ShaperError::RateLimitOverflow));
        // ceil below rate fraction
        assert_eq!(shaper.set_ceil(a, 0.1), Err(ShaperError::CeilLimitOverflow));

        shaper.set_name(a, "alpha").unwrap();
        assert_eq!(shaper.find("alpha"), Some(a));
        assert_eq!(shaper.set_name(aa, "alpha"), Err(ShaperError::NameConflict));
    }

    #[test]
    fn test_resize_recomputes_tree() {
        let shaper: TokenShaper<u32> = TokenShaper::new(100);
        let a = shaper.create_child(shaper.root(), "a", 0.5, 1.0).unwrap();
        shaper.resize(40);
        assert_eq!(shaper.capacity(), 40);
        assert_eq!(shaper.token_rate(a), 20);
        assert_eq!(shaper.token_ceil(a), 40);
    }

    #[test]
    fn test_send_queues_when_exhausted() {
        let shaper: TokenShaper<u32> = TokenShaper::new(2);
        assert!(shaper.send(shaper.root(), 1, 1));
        assert!(shaper.send(shaper.root(), 2, 1));
        assert!(!shaper.send(shaper.root(), 3, 1));
        assert_eq!(shaper.queued(shaper.root()), 1);
    }

    #[test]
    fn test_dequeue_on_empty_tree() {
        let shaper: TokenShaper<u32> = TokenShaper::new(4);
        assert_eq!(shaper.dequeue(), None);
        assert_eq!(shaper.actual_rate(shaper.root()), 0);
    }

    #[test]
    fn test_fair_round_robin_dequeue() {
        // root capacity 10, equal children; 6 queued on each side
        let shaper: TokenShaper<&'static str> = TokenShaper::new(10);
        let a = shaper.create_child(shaper.root(), "a", 0.5, 0.5).unwrap();
        let b = shaper.create_child(shaper.root(), "b", 0.5, 0.5).unwrap();

        for _ in 0..6 {
            shaper.enqueue(a, "a");
            shaper.enqueue(b, "b");
        }

        let mut from_a = 0;
        let mut from_b = 0;
        let mut order = Vec::new();
        while let Some(side) = shaper.dequeue() {
            order.push(side);
            match side {
                "a" => from_a += 1,
                _ => from_b += 1,
            }
        }

        // each side is granted its guaranteed half
        assert_eq!(from_a, 5);
        assert_eq!(from_b, 5);
        // and service alternates between the two siblings
        for pair in order.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }

        // releasing a token lets the starved side continue
        shaper.put(a, 1);
        assert_eq!(shaper.dequeue(), Some("a"));
    }

    #[test]
    fn test_queue_timeout_drops_and_counts() {
        let shaper: TokenShaper<u32> = TokenShaper::new(0);
        let dropped: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        shaper.set_timeout_handler(Box::new({
            let dropped = dropped.clone();
            move |item| dropped.lock().unwrap().push(item)
        }));
        shaper.set_queue_timeout(shaper.root(), Duration::from_millis(5));

        shaper.enqueue(shaper.root(), 7);
        shaper.enqueue(shaper.root(), 8);
        assert_eq!(shaper.queued(shaper.root()), 2);

        // nothing is old enough yet
        let deadline = shaper.run_timeouts(Instant::now());
        assert!(deadline.is_some());
        assert_eq!(shaper.dropped(shaper.root()), 0);

        // well past the timeout, both items are dropped in FIFO order
        let deadline = shaper.run_timeouts(Instant::now() + Duration::from_secs(1));
        assert_eq!(deadline, None);
        assert_eq!(*dropped.lock().unwrap(), vec![7, 8]);
        assert_eq!(shaper.dropped(shaper.root()), 2);
        assert_eq!(shaper.queued(shaper.root()), 0);
    }

    #[test]
    fn test_destroy_bucket() {
        let shaper: TokenShaper<u32> = TokenShaper::new(10);
        let a = shaper.create_child(shaper.root(), "a", 0.5, 0.5).unwrap();
        let aa = shaper.create_child(a, "aa", 1.0, 1.0).unwrap();
        shaper.enqueue(aa, 42);

        let dropped: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        shaper.set_timeout_handler(Box::new({
            let dropped = dropped.clone();
            move |item| dropped.lock().unwrap().push(item)
        }));

        shaper.destroy(a).unwrap();
        assert_eq!(shaper.find("a"), None);
        assert_eq!(shaper.find("aa"), None);
        assert_eq!(*dropped.lock().unwrap(), vec![42]);
        assert_eq!(shaper.destroy(shaper.root()), Err(ShaperError::InvalidChildNode));
    }

    #[test]
    fn test_stats_snapshot_and_json() {
        let shaper: TokenShaper<u32> = TokenShaper::new(10);
        let a = shaper.create_child(shaper.root(), "a", 0.5, 1.0).unwrap();
        shaper.get(a, 3);

        let stats = shaper.stats();
        assert_eq!(stats.name, "root");
        assert_eq!(stats.actual_rate, 3);
        assert_eq!(stats.children.len(), 1);
        assert_eq!(stats.children[0].name, "a");
        assert_eq!(stats.children[0].token_rate, 5);

        let json = shaper.to_json();
        assert!(json.contains("\"token-rate\""));
        assert!(json.contains("\"a\""));
    }

    #[test]
    fn test_concurrent_get_put() {
        let shaper: Arc<TokenShaper<u32>> = Arc::new(TokenShaper::new(1000));
        let a = shaper.create_child(shaper.root(), "a", 0.5, 1.0).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let shaper = shaper.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    if shaper.get(a, 1) == 1 {
                        shaper.put(a, 1);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(shaper.actual_rate(a), 0);
        assert_eq!(shaper.actual_rate(shaper.root()), 0);
    }
}
