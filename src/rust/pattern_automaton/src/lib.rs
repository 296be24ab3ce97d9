//! Multi-pattern substring matching automaton (Aho–Corasick).
//!
//! An [`Automaton`] starts out *open*: patterns are added one by one, each
//! tagged with a caller-chosen [`PatternId`]. [`Automaton::finalize`] computes
//! failure links and output closures and flips it to *closed*, after which
//! [`Automaton::search`] reports every occurrence of every pattern through a
//! callback. The node table is a flat arena under a fixed node budget; links
//! between nodes are indices into it, never pointers.

mod node;

use std::{collections::VecDeque, fmt, fmt::Write as _};

use smallvec::SmallVec;

pub use crate::node::{NodeId, PatternId};
use crate::node::{Node, ROOT};

/// Hard ceiling on a single pattern's length in bytes.
pub const PATTERN_MAX_LEN: usize = 1024;

/// Default node reserve per automaton. Fixed at creation; adding patterns past
/// it fails with [`AddError::CapacityExceeded`].
pub const NODE_RESERVE: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddError {
	ZeroLength,
	TooLong,
	Duplicate,
	CapacityExceeded,
	Closed,
}

impl fmt::Display for AddError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::ZeroLength => write!(f, "Pattern is empty"),
			Self::TooLong => write!(f, "Pattern exceeds {PATTERN_MAX_LEN} bytes"),
			Self::Duplicate => write!(f, "Pattern already present"),
			Self::CapacityExceeded => write!(f, "Node reserve exhausted"),
			Self::Closed => write!(f, "Automaton is finalized"),
		}
	}
}

impl std::error::Error for AddError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchError {
	NotFinalized,
}

impl fmt::Display for SearchError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NotFinalized => write!(f, "Automaton is not finalized"),
		}
	}
}

impl std::error::Error for SearchError {}

/// How a [`Automaton::search`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
	/// The whole text was scanned.
	Completed,
	/// The callback returned `false` and the scan stopped early.
	Stopped,
}

pub struct Automaton {
	nodes:      Vec<Node>,
	node_limit: usize,
	ignorecase: bool,
	finalized:  bool,
	patterns:   usize,
}

impl Automaton {
	#[must_use]
	pub fn new(ignorecase: bool) -> Self { Self::with_node_limit(ignorecase, NODE_RESERVE) }

	/// `node_limit` is a hard budget on arena size, not a pre-allocation; the
	/// arena grows on demand up to it and is indexed by [`NodeId`], so growth
	/// never invalidates a link.
	#[must_use]
	pub fn with_node_limit(ignorecase: bool, node_limit: usize) -> Self {
		let node_limit = node_limit.max(1);
		let mut nodes = Vec::with_capacity(node_limit.min(64));
		nodes.push(Node::new(ROOT, 0));
		Self { nodes, node_limit, ignorecase, finalized: false, patterns: 0 }
	}

	/// ASCII-only case folding, applied identically at add and search time.
	#[inline]
	fn fold(&self, alpha: u8) -> u8 {
		if self.ignorecase { alpha.to_ascii_lowercase() } else { alpha }
	}

	/// Adds `pattern` to the trie under id `pid`.
	///
	/// A capacity failure leaves any prefix nodes created so far in place;
	/// they carry no terminal bit and are harmless.
	pub fn add(&mut self, pattern: &[u8], pid: PatternId) -> Result<(), AddError> {
		if self.finalized {
			return Err(AddError::Closed);
		}
		if pattern.is_empty() {
			return Err(AddError::ZeroLength);
		}
		if pattern.len() > PATTERN_MAX_LEN {
			return Err(AddError::TooLong);
		}

		let mut current = ROOT;
		for &byte in pattern {
			let alpha = self.fold(byte);
			if let Some(child) = self.nodes[current as usize].find_edge(alpha) {
				current = child;
				continue;
			}
			if self.nodes.len() >= self.node_limit {
				return Err(AddError::CapacityExceeded);
			}
			let child = self.nodes.len() as NodeId;
			let depth = self.nodes[current as usize].depth + 1;
			self.nodes.push(Node::new(child, depth));
			self.nodes[current as usize].add_edge(alpha, child);
			current = child;
		}

		let terminal = &mut self.nodes[current as usize];
		if terminal.terminal {
			return Err(AddError::Duplicate);
		}
		terminal.terminal = true;
		terminal.register_output(pid);
		self.patterns += 1;
		Ok(())
	}

	/// Computes failure links and output closures, sorts every node's edges,
	/// and closes the automaton. Calling it again is a no-op.
	pub fn finalize(&mut self) {
		if self.finalized {
			return;
		}
		self.link_failures();
		self.close_outputs();
		for node in &mut self.nodes {
			node.sort_edges();
		}
		self.finalized = true;
	}

	/// Breadth-first failure computation: depth-1 nodes fail to the root, a
	/// deeper node fails to the longest proper suffix of its path that exists
	/// in the trie. The root's failure link stays unset.
	fn link_failures(&mut self) {
		let mut queue: VecDeque<NodeId> = VecDeque::new();
		let root_children: Vec<(u8, NodeId)> = self.nodes[ROOT as usize].edges.to_vec();
		for (_, child) in root_children {
			self.nodes[child as usize].failure = Some(ROOT);
			queue.push_back(child);
		}

		while let Some(id) = queue.pop_front() {
			let edges: Vec<(u8, NodeId)> = self.nodes[id as usize].edges.to_vec();
			for (alpha, child) in edges {
				let mut probe = self.nodes[id as usize].failure;
				let mut target = ROOT;
				while let Some(fid) = probe {
					if let Some(next) = self.nodes[fid as usize].find_edge(alpha) {
						target = next;
						break;
					}
					probe = self.nodes[fid as usize].failure;
				}
				self.nodes[child as usize].failure = Some(target);
				queue.push_back(child);
			}
		}
	}

	/// Unions every node's output set with the outputs found along its failure
	/// chain, and propagates the terminal bit the same way.
	fn close_outputs(&mut self) {
		for i in 0..self.nodes.len() {
			let mut inherited: SmallVec<[PatternId; 4]> = SmallVec::new();
			let mut terminal = self.nodes[i].terminal;
			let mut probe = self.nodes[i].failure;
			while let Some(fid) = probe {
				let ancestor = &self.nodes[fid as usize];
				inherited.extend(ancestor.outputs.iter().copied());
				terminal |= ancestor.terminal;
				probe = ancestor.failure;
			}
			let node = &mut self.nodes[i];
			for pid in inherited {
				node.register_output(pid);
			}
			node.terminal = terminal;
		}
	}

	/// Scans `text`, invoking `callback(end_position, output_pids)` at every
	/// position where one or more patterns end. The callback returns `true`
	/// to continue and `false` to stop the scan.
	///
	/// The scan follows a failure link without consuming input; a miss at the
	/// root consumes one byte. Matches are only reported after a real edge
	/// transition: the arrived node's output closure already carries every
	/// pattern ending at that position, so reporting after a failure hop
	/// would double-count.
	pub fn search<F>(&self, text: &[u8], mut callback: F) -> Result<SearchOutcome, SearchError>
	where
		F: FnMut(usize, &[PatternId]) -> bool,
	{
		if !self.finalized {
			return Err(SearchError::NotFinalized);
		}

		let mut current = ROOT as usize;
		let mut position = 0;
		while position < text.len() {
			let alpha = self.fold(text[position]);
			if let Some(next) = self.nodes[current].find_edge_sorted(alpha) {
				current = next as usize;
				position += 1;
				let node = &self.nodes[current];
				if node.terminal && !callback(position, &node.outputs) {
					return Ok(SearchOutcome::Stopped);
				}
			} else if let Some(failure) = self.nodes[current].failure {
				current = failure as usize;
			} else {
				position += 1;
			}
		}
		Ok(SearchOutcome::Completed)
	}

	#[must_use]
	pub fn is_finalized(&self) -> bool { self.finalized }

	#[must_use]
	pub fn node_count(&self) -> usize { self.nodes.len() }

	#[must_use]
	pub fn pattern_count(&self) -> usize { self.patterns }

	/// Estimated heap footprint of the node arena in bytes.
	#[must_use]
	pub fn heap_bytes(&self) -> usize { self.nodes.iter().map(Node::heap_bytes).sum() }

	/// Renders the node table in human-readable form, one node per line with
	/// its failure link, edges and output set.
	#[must_use]
	pub fn dump(&self) -> String {
		let mut out = String::new();
		for node in &self.nodes {
			let _ = write!(out, "node({}) depth={}", node.id, node.depth);
			if let Some(failure) = node.failure {
				let _ = write!(out, " fail->{failure}");
			}
			for &(alpha, child) in &node.edges {
				if alpha.is_ascii_graphic() {
					let _ = write!(out, " '{}'->{child}", alpha as char);
				} else {
					let _ = write!(out, " {alpha:#04x}->{child}");
				}
			}
			if node.terminal {
				let _ = write!(out, " outputs={:?}", node.outputs.as_slice());
			}
			out.push('\n');
		}
		out
	}

	#[cfg(test)]
	fn node(&self, id: NodeId) -> &Node { &self.nodes[id as usize] }
}
