use pattern_automaton::PatternId;
use smallvec::SmallVec;

/// Bucket count of a bundle's pid hash table.
pub const BUNDLE_BUCKETS: usize = 199;

/// A caller-held set of pattern ids, used to filter a replica's match
/// accumulator after a search. A bundle never owns pattern strings; while its
/// entries are installed in a domain each one contributes a reference to its
/// slot. Entries form a multiset: adding the same pattern twice through
/// [`crate::Domain::add_patterns`] yields two entries and two references.
pub struct Bundle {
	buckets: Vec<SmallVec<[PatternId; 2]>>,
	len:     usize,
}

impl Bundle {
	#[must_use]
	pub fn new() -> Self { Self { buckets: vec![SmallVec::new(); BUNDLE_BUCKETS], len: 0 } }

	pub(crate) fn insert(&mut self, pid: PatternId) {
		self.buckets[pid as usize % BUNDLE_BUCKETS].push(pid);
		self.len += 1;
	}

	#[inline]
	#[must_use]
	pub fn contains(&self, pid: PatternId) -> bool { self.buckets[pid as usize % BUNDLE_BUCKETS].contains(&pid) }

	#[must_use]
	pub fn len(&self) -> usize { self.len }

	#[must_use]
	pub fn is_empty(&self) -> bool { self.len == 0 }

	/// Empties every bucket, yielding the removed entries.
	pub(crate) fn drain(&mut self) -> Vec<PatternId> {
		self.len = 0;
		let mut pids = Vec::new();
		for bucket in &mut self.buckets {
			pids.extend(bucket.drain(..));
		}
		pids
	}
}

impl Default for Bundle {
	fn default() -> Self { Self::new() }
}
