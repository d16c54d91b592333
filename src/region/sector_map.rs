//! The in-memory sector directory: a packed `u32` word per id, mirroring the
//! on-disk sector-map column, plus a small table of special sentinel values
//! (spec §3, §4.2).

use std::sync::Arc;

use crate::error::SectorKvError;
use crate::region::sector_location::SectorLocation;

/// What a registered conflict handler decides to do when ordinary sector
/// allocation happens to produce the same raw word as a special sentinel.
pub enum ConflictResolution {
	/// Proceed with the write using (possibly transformed) payload bytes.
	Proceed(Vec<u8>),
	/// Divert this write away from inline storage entirely (e.g. to ExtRegion).
	Divert,
}

pub type SpecialReaderFn = dyn Fn() -> Vec<u8> + Send + Sync;
pub type ConflictHandlerFn = dyn Fn(u32, &[u8]) -> ConflictResolution + Send + Sync;

/// A registered sentinel: a reserved raw 32-bit sector-map word that does not
/// address real sectors, a marker token identifying it, a reader producing a
/// synthetic payload, and an optional handler invoked when normal allocation
/// happens to produce the same raw value.
pub struct SpecialEntry {
	pub raw: u32,
	pub marker: u8,
	pub reader: Arc<SpecialReaderFn>,
	pub on_conflict: Option<Arc<ConflictHandlerFn>>,
}

/// The id -> packed-sector-location directory for one region, plus any
/// registered special entries.
pub struct SectorMap {
	words: Vec<u32>,
	specials: Vec<SpecialEntry>,
}

impl SectorMap {
	pub fn new(key_count: u32) -> Self {
		Self { words: vec![0u32; key_count as usize], specials: Vec::new() }
	}

	pub fn from_words(words: Vec<u32>) -> Self {
		Self { words, specials: Vec::new() }
	}

	pub fn key_count(&self) -> u32 {
		self.words.len() as u32
	}

	pub fn register_special(&mut self, entry: SpecialEntry) {
		self.specials.push(entry);
	}

	fn special_for_raw(&self, raw: u32) -> Option<&SpecialEntry> {
		self.specials.iter().find(|s| s.raw == raw)
	}

	fn special_for_marker(&self, marker: u8) -> Option<&SpecialEntry> {
		self.specials.iter().find(|s| s.marker == marker)
	}

	/// Whether the raw word at `id` matches a registered special sentinel.
	pub fn is_special(&self, id: u32) -> bool {
		self.special_for_raw(self.words[id as usize]).is_some()
	}

	/// Whether any entry (normal or special) is present for `id`.
	pub fn has(&self, id: u32) -> bool {
		self.words[id as usize] != 0
	}

	/// The normal sector location for `id`, or `None` if absent or special.
	pub fn get(&self, id: u32) -> Option<SectorLocation> {
		let raw = self.words[id as usize];
		if raw == 0 || self.special_for_raw(raw).is_some() {
			None
		} else {
			Some(SectorLocation::from_raw(raw))
		}
	}

	/// The raw word for `id`, whatever it represents.
	pub fn get_raw(&self, id: u32) -> u32 {
		self.words[id as usize]
	}

	/// Installs `loc` as the normal sector location for `id`. Rejects
	/// locations whose size or offset exceed the design maxima with
	/// `UnsupportedData`-shaped errors at the call site (callers construct
	/// `loc` via `SectorLocation::new`, which already enforces the offset
	/// bound; size is a `u8` and therefore always `<= 255`).
	///
	/// Returns the registered conflict handler if `loc`'s raw word happens to
	/// collide with a special sentinel (spec §9's "conflict between a normal
	/// allocation and a registered special sentinel raw value").
	pub fn set(&mut self, id: u32, loc: SectorLocation) -> Option<Arc<ConflictHandlerFn>> {
		let raw = loc.raw();
		self.words[id as usize] = raw;
		self.special_for_raw(raw).and_then(|s| s.on_conflict.clone())
	}

	/// Directly overwrites the raw word (used when restoring from disk).
	pub fn set_raw(&mut self, id: u32, raw: u32) {
		self.words[id as usize] = raw;
	}

	/// Clears `id`'s entry to the "absent" sentinel.
	pub fn clear(&mut self, id: u32) {
		self.words[id as usize] = 0;
	}

	/// Installs the special entry matching `marker` as `id`'s entry. Fails
	/// with `InvalidArgument` if no special entry registers that marker.
	pub fn set_special(&mut self, id: u32, marker: u8) -> Result<(), SectorKvError> {
		let raw = self
			.special_for_marker(marker)
			.ok_or_else(|| SectorKvError::InvalidArgument(format!("unregistered special marker {marker}")))?
			.raw;
		self.words[id as usize] = raw;
		Ok(())
	}

	/// Produces the synthetic payload for `id` if it holds a special entry.
	pub fn try_special_value(&self, id: u32) -> Option<Vec<u8>> {
		self.special_for_raw(self.words[id as usize]).map(|s| (s.reader)())
	}

	/// Iterates `(id, SectorLocation)` for every id with a normal (non-zero,
	/// non-special) entry, in ascending id order. Used to seed the used-
	/// sectors bitmap and to drive `for_each_key`/`all_keys`.
	pub fn iter_locations(&self) -> impl Iterator<Item = (u32, SectorLocation)> + '_ {
		self.words.iter().enumerate().filter_map(move |(id, &raw)| {
			if raw == 0 || self.special_for_raw(raw).is_some() {
				None
			} else {
				Some((id as u32, SectorLocation::from_raw(raw)))
			}
		})
	}

	/// Iterates every id with *any* present entry (normal or special), in
	/// ascending order.
	pub fn iter_present_ids(&self) -> impl Iterator<Item = u32> + '_ {
		self.words.iter().enumerate().filter_map(|(id, &raw)| (raw != 0).then_some(id as u32))
	}
}
