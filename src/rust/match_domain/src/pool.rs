use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use pattern_automaton::{AddError, Automaton, PatternId};
use tracing::{debug, warn};

use crate::registry::SlotTable;

/// One hit recorded by a search: the pattern's slot id and the end position
/// (exclusive, in bytes) of the occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
	pub pid: PatternId,
	pub end: usize,
}

pub(crate) struct ReplicaCore {
	pub automaton: Automaton,
	pub matches:   Vec<Match>,
}

/// One automaton replica. The `in_use` flag is the exclusive lease: both the
/// lease path and the rebuild task claim a replica with a 0→1 transition, so
/// a rebuild can never observe a replica mid-search. `freed` is set by the
/// lease holder on return and consumed by the owning executor's reap pass;
/// `dirty` marks a stale build.
pub(crate) struct Replica {
	pub core:   Mutex<ReplicaCore>,
	pub in_use: AtomicBool,
	pub dirty:  AtomicBool,
	pub freed:  AtomicBool,
}

impl Replica {
	pub fn new(automaton: Automaton) -> Self {
		Self {
			core:   Mutex::new(ReplicaCore { automaton, matches: Vec::new() }),
			in_use: AtomicBool::new(false),
			dirty:  AtomicBool::new(false),
			freed:  AtomicBool::new(false),
		}
	}
}

/// Free and leased replica indices of one executor, plus the flag carrying a
/// pending rebuild over to replicas that were leased while it was scheduled.
/// Only held briefly; the mutex stands in for executor pinning.
pub(crate) struct PoolLists {
	pub free:       Vec<usize>,
	pub leased:     Vec<usize>,
	pub rebuilding: bool,
}

pub(crate) struct Executor {
	pub pool: Mutex<PoolLists>,
	pub tx:   Sender<Task>,
}

pub(crate) enum Task {
	Rebuild(usize),
	Barrier(Sender<()>),
	Shutdown,
}

/// Rebuilds one replica from the live slots. Runs on the replica's owning
/// executor worker. Silently defers when the replica got leased again; the
/// next reap pass reschedules it.
pub(crate) fn rebuild_replica(replica: &Replica, slots: &SlotTable, mem: &MemCounters, ignorecase: bool) {
	if replica.in_use.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
		debug!("rebuild deferred, replica is leased");
		return;
	}

	let mut core = replica.core.lock();
	mem.note_freed(core.automaton.heap_bytes());

	let mut fresh = Automaton::new(ignorecase);
	let mut capacity_hit = false;
	slots.for_each_live(|pid, text| {
		if capacity_hit {
			return;
		}
		match fresh.add(text.as_bytes(), pid) {
			Ok(()) => {}
			Err(AddError::Duplicate) => debug!(pid, "pattern folds onto an existing trie path, skipping"),
			Err(err @ AddError::CapacityExceeded) => {
				warn!(pid, %err, "rebuild feed stopped, replica stays dirty");
				capacity_hit = true;
			}
			Err(err) => warn!(pid, pattern = text, %err, "skipping pattern"),
		}
	});
	fresh.finalize();
	mem.note_allocated(fresh.heap_bytes());
	core.automaton = fresh;
	drop(core);

	if !capacity_hit {
		replica.dirty.store(false, Ordering::Release);
	}
	replica.in_use.store(false, Ordering::Release);
}

/// Running byte counters behind [`crate::Domain::meminfo`].
#[derive(Default)]
pub(crate) struct MemCounters {
	allocated: AtomicUsize,
	freed:     AtomicUsize,
	peak_live: AtomicUsize,
}

impl MemCounters {
	pub fn note_allocated(&self, bytes: usize) {
		let allocated = self.allocated.fetch_add(bytes, Ordering::Relaxed) + bytes;
		let live = allocated.saturating_sub(self.freed.load(Ordering::Relaxed));
		self.peak_live.fetch_max(live, Ordering::Relaxed);
	}

	pub fn note_freed(&self, bytes: usize) { self.freed.fetch_add(bytes, Ordering::Relaxed); }

	pub fn snapshot(&self) -> MemInfo {
		MemInfo {
			allocated: self.allocated.load(Ordering::Relaxed),
			freed:     self.freed.load(Ordering::Relaxed),
			peak_live: self.peak_live.load(Ordering::Relaxed),
		}
	}
}

/// Snapshot of a domain's automaton memory accounting, in estimated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
	pub allocated: usize,
	pub freed:     usize,
	pub peak_live: usize,
}
