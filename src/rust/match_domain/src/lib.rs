//! Multi-pattern matching domains.
//!
//! A [`Domain`] owns a pattern slot table and, per executor, a pool of
//! equivalent [`pattern_automaton::Automaton`] replicas. Callers group
//! patterns into [`Bundle`]s, lease a replica from their executor's pool,
//! search, and walk the replica's match accumulator filtered by bundle. Adding
//! or removing patterns marks replicas dirty; rebuilds run asynchronously on
//! each executor's worker thread between leases, so the search path never
//! waits on a recompile.

mod bundle;
mod pool;
mod registry;

use std::{
	fmt,
	hash::{Hash, Hasher},
	num::NonZeroUsize,
	sync::{Arc, atomic::Ordering},
	thread,
	thread::JoinHandle,
};

use compact_str::CompactString;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use pattern_automaton::{PATTERN_MAX_LEN, PatternId, SearchOutcome};

pub use crate::{
	bundle::{BUNDLE_BUCKETS, Bundle},
	pool::{Match, MemInfo},
};
use crate::{
	pool::{Executor, MemCounters, PoolLists, Replica, ReplicaCore, Task, rebuild_replica},
	registry::SlotTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainError {
	/// The domain lock is contended; retry.
	Busy,
	/// The slot table is full; remove patterns and retry.
	OutOfSlots,
	EmptyPattern,
	PatternTooLong,
	/// Searched a replica whose automaton is not finalized.
	NotReady,
	InvalidConfig,
	OutOfMemory,
}

impl fmt::Display for DomainError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Busy => write!(f, "Domain lock is contended"),
			Self::OutOfSlots => write!(f, "Pattern slot table is full"),
			Self::EmptyPattern => write!(f, "Pattern is empty"),
			Self::PatternTooLong => write!(f, "Pattern exceeds {PATTERN_MAX_LEN} bytes"),
			Self::NotReady => write!(f, "Automaton is not finalized"),
			Self::InvalidConfig => write!(f, "Domain configuration is invalid"),
			Self::OutOfMemory => write!(f, "Resource allocation failed"),
		}
	}
}

impl std::error::Error for DomainError {}

pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
	/// Label used in diagnostics and worker thread names.
	pub name:                   String,
	/// Replicas per executor pool.
	pub automatas_per_executor: usize,
	/// Slot table size; hard ceiling on distinct live patterns.
	pub patterns_max:           usize,
	/// ASCII-only case folding, applied on add and search alike.
	pub ignorecase:             bool,
	/// Executor count; 0 selects the machine's available parallelism.
	pub executors:              usize,
}

impl Default for DomainConfig {
	fn default() -> Self {
		Self { name: "matching".to_owned(), automatas_per_executor: 1, patterns_max: 128, ignorecase: false, executors: 0 }
	}
}

struct Shared {
	name:       CompactString,
	ignorecase: bool,
	slots:      SlotTable,
	replicas:   Vec<Replica>,
	executors:  Vec<Executor>,
	/// The domain lock: serializes registry mutation and rebuild scheduling.
	/// Taken with `try_lock` only.
	lock:       Mutex<()>,
	mem:        MemCounters,
}

pub struct Domain {
	shared:  Arc<Shared>,
	workers: Vec<JoinHandle<()>>,
}

impl Domain {
	/// Builds the slot table, one rebuild worker per executor, and per
	/// executor a free list of `automatas_per_executor` finalized empty
	/// replicas.
	pub fn open(config: DomainConfig) -> Result<Self> {
		if config.automatas_per_executor == 0 || config.patterns_max == 0 {
			return Err(DomainError::InvalidConfig);
		}
		let executor_count = if config.executors == 0 {
			thread::available_parallelism().map_or(1, NonZeroUsize::get)
		} else {
			config.executors
		};

		let mem = MemCounters::default();
		let replica_count = executor_count * config.automatas_per_executor;
		let mut replicas = Vec::with_capacity(replica_count);
		for _ in 0..replica_count {
			let mut automaton = pattern_automaton::Automaton::new(config.ignorecase);
			automaton.finalize();
			mem.note_allocated(automaton.heap_bytes());
			replicas.push(Replica::new(automaton));
		}

		let mut executors = Vec::with_capacity(executor_count);
		let mut receivers = Vec::with_capacity(executor_count);
		for e in 0..executor_count {
			let (tx, rx) = crossbeam_channel::unbounded();
			let base = e * config.automatas_per_executor;
			let free = (base..base + config.automatas_per_executor).collect();
			executors.push(Executor { pool: Mutex::new(PoolLists { free, leased: Vec::new(), rebuilding: false }), tx });
			receivers.push(rx);
		}

		let shared = Arc::new(Shared {
			name: CompactString::new(&config.name),
			ignorecase: config.ignorecase,
			slots: SlotTable::new(config.patterns_max),
			replicas,
			executors,
			lock: Mutex::new(()),
			mem,
		});

		let mut workers = Vec::with_capacity(executor_count);
		for (e, rx) in receivers.into_iter().enumerate() {
			let worker_shared = Arc::clone(&shared);
			let spawned = thread::Builder::new()
				.name(format!("{}-rebuild-{e}", config.name))
				.spawn(move || worker_loop(&rx, &worker_shared));
			match spawned {
				Ok(handle) => workers.push(handle),
				Err(_) => {
					for executor in &shared.executors {
						let _ = executor.tx.send(Task::Shutdown);
					}
					return Err(DomainError::OutOfMemory);
				}
			}
		}

		Ok(Self { shared, workers })
	}

	#[must_use]
	pub fn name(&self) -> &str { &self.shared.name }

	/// Interns each pattern, adds one bundle entry per input string and bumps
	/// the slot refcounts. A failure part-way through keeps the entries
	/// already inserted; nothing is rolled back. Fresh slots schedule an
	/// asynchronous rebuild of every replica.
	pub fn add_patterns(&self, patterns: &[&str], bundle: &mut Bundle) -> Result<()> {
		let Some(_guard) = self.shared.lock.try_lock() else {
			return Err(DomainError::Busy);
		};

		let mut need_rebuild = false;
		let mut result = Ok(());
		for &pattern in patterns {
			if pattern.is_empty() {
				result = Err(DomainError::EmptyPattern);
				break;
			}
			if pattern.len() > PATTERN_MAX_LEN {
				result = Err(DomainError::PatternTooLong);
				break;
			}
			let Some((pid, fresh)) = self.shared.slots.intern(pattern) else {
				result = Err(DomainError::OutOfSlots);
				break;
			};
			self.shared.slots.incref(pid);
			bundle.insert(pid);
			need_rebuild |= fresh;
		}

		if need_rebuild {
			self.schedule_rebuild();
		}
		result
	}

	/// Removes every entry of `bundle` from the domain, dropping one slot
	/// reference per entry. Slots whose count reaches zero schedule a rebuild
	/// that compiles them out. The bundle is left empty and reusable.
	pub fn remove_patterns(&self, bundle: &mut Bundle) -> Result<()> {
		let Some(_guard) = self.shared.lock.try_lock() else {
			return Err(DomainError::Busy);
		};

		let mut need_rebuild = false;
		for pid in bundle.drain() {
			need_rebuild |= self.shared.slots.decref(pid);
		}
		if need_rebuild {
			self.schedule_rebuild();
		}
		Ok(())
	}

	/// Marks every free replica dirty and posts a rebuild task for it to its
	/// owning executor. Leased replicas are covered by the `rebuilding` flag,
	/// which the reap pass turns into `dirty` on return.
	///
	/// Caller holds the domain lock.
	fn schedule_rebuild(&self) {
		for executor in &self.shared.executors {
			let mut pool = executor.pool.lock();
			for &idx in &pool.free {
				self.shared.replicas[idx].dirty.store(true, Ordering::Relaxed);
				if executor.tx.send(Task::Rebuild(idx)).is_err() {
					warn!(domain = %self.shared.name, replica = idx, "rebuild worker is gone");
				}
			}
			pool.rebuilding = true;
		}
	}

	fn current_executor(&self) -> usize {
		let mut hasher = FxHasher::default();
		thread::current().id().hash(&mut hasher);
		hasher.finish() as usize % self.shared.executors.len()
	}

	/// Runs the reap pass on the calling thread's executor: returned replicas
	/// move back to the free list and stale ones get their rebuild posted.
	pub fn reap(&self) { self.reap_executor(self.current_executor()); }

	fn reap_executor(&self, executor: usize) {
		let exec = &self.shared.executors[executor];
		let mut pool = exec.pool.lock();
		let mut i = 0;
		while i < pool.leased.len() {
			let idx = pool.leased[i];
			let replica = &self.shared.replicas[idx];
			if !replica.freed.load(Ordering::Acquire) {
				i += 1;
				continue;
			}
			pool.leased.remove(i);
			replica.freed.store(false, Ordering::Relaxed);
			replica.in_use.store(false, Ordering::Release);
			if pool.rebuilding {
				replica.dirty.store(true, Ordering::Relaxed);
			}
			if replica.dirty.load(Ordering::Relaxed) {
				debug!(domain = %self.shared.name, replica = idx, "posting rebuild on reap");
				if exec.tx.send(Task::Rebuild(idx)).is_err() {
					warn!(domain = %self.shared.name, replica = idx, "rebuild worker is gone");
				}
			}
			pool.free.push(idx);
		}
		pool.rebuilding = false;
	}

	/// Leases a replica from the calling thread's executor pool, after a reap
	/// pass. The replica's match accumulator is cleared here, at lease time,
	/// so a returned replica keeps its matches readable until someone leases
	/// it again. `None` when every replica of the pool is taken.
	pub fn lease(&self) -> Option<Lease<'_>> {
		let executor = self.current_executor();
		self.reap_executor(executor);

		let mut pool = self.shared.executors[executor].pool.lock();
		let position = pool.free.iter().position(|&idx| {
			self.shared.replicas[idx]
				.in_use
				.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
		})?;
		let idx = pool.free.remove(position);
		pool.leased.push(idx);
		drop(pool);

		self.shared.replicas[idx].core.lock().matches.clear();
		Some(Lease { domain: self, replica: idx })
	}

	/// Pattern string currently held by slot `pid`, if any.
	#[must_use]
	pub fn pattern(&self, pid: PatternId) -> Option<CompactString> { self.shared.slots.pattern(pid) }

	/// Byte counters over every automaton this domain has built and released.
	#[must_use]
	pub fn meminfo(&self) -> MemInfo { self.shared.mem.snapshot() }

	/// Blocks until every rebuild task queued so far has run. Lease after an
	/// add or remove only guarantees eventual consistency; callers that need
	/// the post-change automaton reap their executor and then quiesce.
	pub fn quiesce(&self) {
		let (tx, rx) = crossbeam_channel::bounded(self.shared.executors.len());
		let mut pending = 0;
		for executor in &self.shared.executors {
			if executor.tx.send(Task::Barrier(tx.clone())).is_ok() {
				pending += 1;
			}
		}
		drop(tx);
		for _ in 0..pending {
			if rx.recv().is_err() {
				break;
			}
		}
	}
}

impl Drop for Domain {
	fn drop(&mut self) {
		for executor in &self.shared.executors {
			let _ = executor.tx.send(Task::Shutdown);
		}
		for handle in self.workers.drain(..) {
			let _ = handle.join();
		}
		self.shared.slots.clear();
	}
}

fn worker_loop(rx: &Receiver<Task>, shared: &Shared) {
	while let Ok(task) = rx.recv() {
		match task {
			Task::Rebuild(idx) => rebuild_replica(&shared.replicas[idx], &shared.slots, &shared.mem, shared.ignorecase),
			Task::Barrier(done) => {
				let _ = done.send(());
			}
			Task::Shutdown => break,
		}
	}
}

/// Cursor into a leased replica's match accumulator; see [`Lease::next_match`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchCursor(usize);

impl MatchCursor {
	#[must_use]
	pub fn new() -> Self { Self(0) }
}

/// Exclusive hold on one replica. Searching appends to the replica's match
/// accumulator; bundles then view the accumulator independently of each
/// other. Dropping the lease returns the replica; the owning executor's next
/// reap pass links it back into the free list.
pub struct Lease<'d> {
	domain:  &'d Domain,
	replica: usize,
}

impl Lease<'_> {
	/// Scans `text`, appending every reported occurrence to the accumulator.
	/// Self-contained: each call starts at the automaton root.
	pub fn search(&self, text: &[u8]) -> Result<SearchOutcome> {
		let mut core = self.domain.shared.replicas[self.replica].core.lock();
		let ReplicaCore { automaton, matches } = &mut *core;
		automaton
			.search(text, |end, pids| {
				matches.extend(pids.iter().map(|&pid| Match { pid, end }));
				true
			})
			.map_err(|_| DomainError::NotReady)
	}

	/// Advances `cursor` to the next accumulated match whose pid is present
	/// in `bundle`; entries belonging to other bundles are skipped.
	pub fn next_match(&self, cursor: &mut MatchCursor, bundle: &Bundle) -> Option<Match> {
		let core = self.domain.shared.replicas[self.replica].core.lock();
		while cursor.0 < core.matches.len() {
			let matched = core.matches[cursor.0];
			cursor.0 += 1;
			if bundle.contains(matched.pid) {
				return Some(matched);
			}
		}
		None
	}

	/// The raw accumulator, unfiltered.
	#[must_use]
	pub fn matches(&self) -> Vec<Match> { self.domain.shared.replicas[self.replica].core.lock().matches.clone() }
}

impl Drop for Lease<'_> {
	fn drop(&mut self) { self.domain.shared.replicas[self.replica].freed.store(true, Ordering::Release); }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(patterns_max: usize) -> DomainConfig {
		DomainConfig {
			name: "test".to_owned(),
			automatas_per_executor: 1,
			patterns_max,
			ignorecase: false,
			executors: 1,
		}
	}

	fn ends(lease: &Lease<'_>, bundle: &Bundle) -> Vec<usize> {
		let mut cursor = MatchCursor::new();
		let mut ends = Vec::new();
		while let Some(matched) = lease.next_match(&mut cursor, bundle) {
			ends.push(matched.end);
		}
		ends
	}

	#[test]
	fn test_two_bundles_filter_one_accumulator() {
		let domain = Domain::open(config(16)).unwrap();
		let mut hosts1 = Bundle::new();
		domain.add_patterns(&["microsoft.com", "amazon.com", "ebay.com"], &mut hosts1).unwrap();
		let mut hosts2 = Bundle::new();
		domain.add_patterns(&["linkedin.com", "wikipedia.org", "ebay.com", "lin"], &mut hosts2).unwrap();
		domain.quiesce();

		let lease = domain.lease().unwrap();
		lease.search(b"www.linkedin.com/index.html").unwrap();

		let mut cursor = MatchCursor::new();
		assert!(lease.next_match(&mut cursor, &hosts1).is_none());

		let mut cursor = MatchCursor::new();
		let first = lease.next_match(&mut cursor, &hosts2).unwrap();
		assert_eq!(domain.pattern(first.pid).as_deref(), Some("lin"));
		assert_eq!(first.end, 7);
		let second = lease.next_match(&mut cursor, &hosts2).unwrap();
		assert_eq!(domain.pattern(second.pid).as_deref(), Some("linkedin.com"));
		assert_eq!(second.end, 16);
		assert!(lease.next_match(&mut cursor, &hosts2).is_none());
	}

	#[test]
	fn test_shared_pattern_visible_to_both_bundles() {
		let domain = Domain::open(config(16)).unwrap();
		let mut hosts1 = Bundle::new();
		domain.add_patterns(&["microsoft.com", "amazon.com", "ebay.com"], &mut hosts1).unwrap();
		let mut hosts2 = Bundle::new();
		domain.add_patterns(&["linkedin.com", "wikipedia.org", "ebay.com", "lin"], &mut hosts2).unwrap();
		domain.quiesce();

		let lease = domain.lease().unwrap();
		lease.search(b"www.ebay.com/index.php").unwrap();

		// One accumulator entry, visible through both bundles.
		assert_eq!(lease.matches().len(), 1);
		let from_b1 = ends(&lease, &hosts1);
		let from_b2 = ends(&lease, &hosts2);
		assert_eq!(from_b1, vec![12]);
		assert_eq!(from_b2, vec![12]);
	}

	#[test]
	fn test_remove_then_reap_rebuilds_empty() {
		let domain = Domain::open(config(8)).unwrap();
		let mut bundle = Bundle::new();
		domain.add_patterns(&["ab", "abc"], &mut bundle).unwrap();
		domain.quiesce();

		{
			let lease = domain.lease().unwrap();
			lease.search(b"abcdef").unwrap();
			assert!(!ends(&lease, &bundle).is_empty());
		}

		domain.remove_patterns(&mut bundle).unwrap();
		assert!(bundle.is_empty());
		domain.reap();
		domain.quiesce();

		let lease = domain.lease().unwrap();
		lease.search(b"abcdef").unwrap();
		assert!(lease.matches().is_empty());
	}

	#[test]
	fn test_ignorecase_domain() {
		let mut cfg = config(8);
		cfg.ignorecase = true;
		let domain = Domain::open(cfg).unwrap();
		let mut bundle = Bundle::new();
		domain.add_patterns(&["HELLO"], &mut bundle).unwrap();
		domain.quiesce();

		let lease = domain.lease().unwrap();
		lease.search(b"hello").unwrap();
		assert_eq!(ends(&lease, &bundle), vec![5]);
	}

	#[test]
	fn test_out_of_slots_keeps_partial_bundle() {
		let domain = Domain::open(config(2)).unwrap();
		let mut bundle = Bundle::new();
		let err = domain.add_patterns(&["a", "b", "c"], &mut bundle).unwrap_err();
		assert_eq!(err, DomainError::OutOfSlots);
		assert_eq!(bundle.len(), 2);
		assert!(bundle.contains(0));
		assert!(bundle.contains(1));
	}

	#[test]
	fn test_pattern_validation_stops_the_batch() {
		let domain = Domain::open(config(8)).unwrap();
		let mut bundle = Bundle::new();
		assert_eq!(domain.add_patterns(&["ok", ""], &mut bundle), Err(DomainError::EmptyPattern));
		assert_eq!(bundle.len(), 1);

		let long = "x".repeat(PATTERN_MAX_LEN + 1);
		assert_eq!(domain.add_patterns(&[&long], &mut bundle), Err(DomainError::PatternTooLong));
		assert_eq!(bundle.len(), 1);
	}

	#[test]
	fn test_busy_when_domain_lock_held() {
		let domain = Domain::open(config(8)).unwrap();
		let _guard = domain.shared.lock.lock();
		let mut bundle = Bundle::new();
		assert_eq!(domain.add_patterns(&["a"], &mut bundle), Err(DomainError::Busy));
		assert_eq!(domain.remove_patterns(&mut bundle), Err(DomainError::Busy));
	}

	#[test]
	fn test_accumulator_cleared_at_lease_not_return() {
		let domain = Domain::open(config(8)).unwrap();
		let mut bundle = Bundle::new();
		domain.add_patterns(&["ab"], &mut bundle).unwrap();
		domain.quiesce();

		{
			let lease = domain.lease().unwrap();
			lease.search(b"abab").unwrap();
			assert_eq!(lease.matches().len(), 2);
		}

		// Same replica, fresh lease: old matches are gone before any search.
		let lease = domain.lease().unwrap();
		assert!(lease.matches().is_empty());
	}

	#[test]
	fn test_bundle_symmetry() {
		let domain = Domain::open(config(8)).unwrap();
		let probe = |domain: &Domain| {
			let lease = domain.lease().unwrap();
			lease.search(b"one fish two fish").unwrap();
			lease.matches().len()
		};
		let baseline = probe(&domain);
		assert_eq!(baseline, 0);

		let mut bundle = Bundle::new();
		domain.add_patterns(&["fish", "two"], &mut bundle).unwrap();
		domain.reap();
		domain.quiesce();
		assert_eq!(probe(&domain), 3);

		domain.remove_patterns(&mut bundle).unwrap();
		domain.reap();
		domain.quiesce();
		assert_eq!(probe(&domain), baseline);
	}

	#[test]
	fn test_refcounts_mirror_bundle_entries() {
		let domain = Domain::open(config(8)).unwrap();
		let mut b1 = Bundle::new();
		domain.add_patterns(&["x", "y", "shared"], &mut b1).unwrap();
		let mut b2 = Bundle::new();
		domain.add_patterns(&["shared", "z"], &mut b2).unwrap();

		let total: usize = (0..8).map(|pid| domain.shared.slots.use_count(pid)).sum();
		assert_eq!(total, b1.len() + b2.len());
		assert_eq!(domain.shared.slots.live_count(), 4);

		let shared_pid = domain.shared.slots.intern("shared").unwrap().0;
		assert_eq!(domain.shared.slots.use_count(shared_pid), 2);
	}

	#[test]
	fn test_meminfo_tracks_rebuilds() {
		let domain = Domain::open(config(8)).unwrap();
		let before = domain.meminfo();
		assert!(before.allocated > 0);
		assert_eq!(before.freed, 0);

		let mut bundle = Bundle::new();
		domain.add_patterns(&["some longer pattern"], &mut bundle).unwrap();
		domain.quiesce();

		let after = domain.meminfo();
		assert!(after.allocated > before.allocated);
		assert!(after.freed > 0);
		assert!(after.peak_live <= after.allocated);
	}

	#[test]
	fn test_lease_exhaustion() {
		let domain = Domain::open(config(8)).unwrap();
		let first = domain.lease().unwrap();
		assert!(domain.lease().is_none());
		drop(first);
		assert!(domain.lease().is_some());
	}

	#[test]
	fn test_invalid_config() {
		let mut cfg = config(8);
		cfg.automatas_per_executor = 0;
		assert_eq!(Domain::open(cfg).err(), Some(DomainError::InvalidConfig));

		let mut cfg = config(8);
		cfg.patterns_max = 0;
		assert_eq!(Domain::open(cfg).err(), Some(DomainError::InvalidConfig));
	}

	#[test]
	fn test_concurrent_lease_and_search() {
		let domain = Domain::open(DomainConfig {
			name: "threads".to_owned(),
			automatas_per_executor: 2,
			patterns_max: 8,
			ignorecase: false,
			executors: 2,
		})
		.unwrap();
		let mut bundle = Bundle::new();
		domain.add_patterns(&["abc"], &mut bundle).unwrap();
		domain.quiesce();

		thread::scope(|scope| {
			for _ in 0..4 {
				scope.spawn(|| {
					for _ in 0..100 {
						if let Some(lease) = domain.lease() {
							lease.search(b"xxabcxx").unwrap();
						}
					}
				});
			}
		});
	}

	#[test]
	fn test_domain_name() {
		let domain = Domain::open(config(2)).unwrap();
		assert_eq!(domain.name(), "test");
	}
}
