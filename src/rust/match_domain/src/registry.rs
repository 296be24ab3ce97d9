use std::sync::atomic::{AtomicUsize, Ordering};

use compact_str::CompactString;
use parking_lot::Mutex;
use pattern_automaton::PatternId;

/// One pattern slot. The slot index doubles as the pattern id compiled into
/// the automata. A slot keeps its last string after the use count drops to
/// zero, both for diagnostics and so a revived pattern gets its old id back;
/// the mutex keeps rebuild readers off a string mid-replacement.
struct Slot {
	text:      Mutex<CompactString>,
	use_count: AtomicUsize,
}

/// Flat slot table of a domain. Mutations happen under the domain lock;
/// rebuild tasks read concurrently through [`SlotTable::for_each_live`].
pub(crate) struct SlotTable {
	slots: Vec<Slot>,
}

impl SlotTable {
	pub fn new(capacity: usize) -> Self {
		let slots = (0..capacity)
			.map(|_| Slot { text: Mutex::new(CompactString::default()), use_count: AtomicUsize::new(0) })
			.collect();
		Self { slots }
	}

	/// Finds `pattern` in the table, claiming the first unused slot when it is
	/// not present. Returns the slot id and whether the automata have to be
	/// rebuilt to pick the pattern up: a brand-new string, or a revived slot
	/// whose pattern had already been rebuilt out of the automata when its
	/// use count hit zero. `None` means the table is full.
	///
	/// Caller holds the domain lock.
	pub fn intern(&self, pattern: &str) -> Option<(PatternId, bool)> {
		let mut free = None;
		for (i, slot) in self.slots.iter().enumerate() {
			let unused = slot.use_count.load(Ordering::Relaxed) == 0;
			if unused && free.is_none() {
				free = Some(i);
			}
			if slot.text.lock().as_str() == pattern {
				return Some((i as PatternId, unused));
			}
		}
		let free = free?;
		*self.slots[free].text.lock() = CompactString::new(pattern);
		Some((free as PatternId, true))
	}

	pub fn incref(&self, pid: PatternId) { self.slots[pid as usize].use_count.fetch_add(1, Ordering::Relaxed); }

	/// Drops one reference; returns true when the count reaches zero. The
	/// string is retained until the slot gets recycled by a later intern.
	pub fn decref(&self, pid: PatternId) -> bool {
		self.slots[pid as usize].use_count.fetch_sub(1, Ordering::Relaxed) == 1
	}

	/// Visits every live slot in slot-index order. This is the rebuild feed;
	/// each string is read under its slot mutex.
	pub fn for_each_live<F>(&self, mut f: F)
	where
		F: FnMut(PatternId, &str),
	{
		for (i, slot) in self.slots.iter().enumerate() {
			if slot.use_count.load(Ordering::Relaxed) == 0 {
				continue;
			}
			let text = slot.text.lock();
			if !text.is_empty() {
				f(i as PatternId, &text);
			}
		}
	}

	pub fn pattern(&self, pid: PatternId) -> Option<CompactString> {
		let slot = self.slots.get(pid as usize)?;
		let text = slot.text.lock();
		if text.is_empty() { None } else { Some(text.clone()) }
	}

	pub fn clear(&self) {
		for slot in &self.slots {
			slot.text.lock().clear();
			slot.use_count.store(0, Ordering::Relaxed);
		}
	}

	#[cfg(test)]
	pub fn live_count(&self) -> usize {
		self.slots.iter().filter(|s| s.use_count.load(Ordering::Relaxed) > 0).count()
	}

	#[cfg(test)]
	pub fn use_count(&self, pid: PatternId) -> usize { self.slots[pid as usize].use_count.load(Ordering::Relaxed) }
}
