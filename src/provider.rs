//! The RegionProvider family: ways of turning a `RegionKey` into an open
//! [`RegionFile`] and back again (spec §4.7). `SimpleRegionProvider` opens
//! and closes on every call; `CachedRegionProvider` keeps a small
//! per-instance LRU; `SharedCachedRegionProvider` delegates to a process-wide
//! [`SharedCache`](crate::shared_cache::SharedCache). All three implement the
//! same [`RegionProvider`] trait so `StorageFront` can hold a fallback chain
//! of them without caring which is backing any given slot.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SectorKvError;
use crate::keymodel::{EntryKey, KeyModel, RegionKey};
use crate::region::header::HeaderColumn;
use crate::region::region_file::RegionFile;
use crate::region::sector_map::SpecialEntry;
use crate::shared_cache::SharedCache;

/// A stable per-factory-instance identity, used as half of a `SharedCache`
/// key so that two distinct stores sharing one global cache never collide on
/// the same `RegionKey` (spec §3, "Cache entry").
pub type FactoryIdentity = usize;

/// Builds `RegionFile`s for one inline region family: fixed `key_count`,
/// fixed `sector_size`, a save directory, and the header columns/special
/// entries every region of this family registers.
pub struct RegionFileFactory {
	save_dir: PathBuf,
	key_model: Arc<dyn KeyModel>,
	sector_size: u32,
	columns: Box<dyn Fn() -> Vec<Box<dyn HeaderColumn>> + Send + Sync>,
	specials: Box<dyn Fn() -> Vec<SpecialEntry> + Send + Sync>,
}

impl RegionFileFactory {
	pub fn new(save_dir: impl Into<PathBuf>, key_model: Arc<dyn KeyModel>, sector_size: u32) -> Self {
		Self {
			save_dir: save_dir.into(),
			key_model,
			sector_size,
			columns: Box::new(Vec::new),
			specials: Box::new(Vec::new),
		}
	}

	pub fn with_columns(mut self, columns: impl Fn() -> Vec<Box<dyn HeaderColumn>> + Send + Sync + 'static) -> Self {
		self.columns = Box::new(columns);
		self
	}

	pub fn with_specials(mut self, specials: impl Fn() -> Vec<SpecialEntry> + Send + Sync + 'static) -> Self {
		self.specials = Box::new(specials);
		self
	}

	pub fn save_dir(&self) -> &Path {
		&self.save_dir
	}

	pub fn key_model(&self) -> &Arc<dyn KeyModel> {
		&self.key_model
	}

	pub fn sector_size(&self) -> u32 {
		self.sector_size
	}

	/// The largest payload this factory's regions can hold inline. A write
	/// larger than this is rejected by `RegionFile::write` itself, but
	/// providers check it here first so a doomed write never creates (or
	/// opens-and-touches) a region file it's only going to leave empty.
	pub fn max_inline_payload_bytes(&self) -> u64 {
		crate::region::region_file::max_inline_payload_bytes(self.sector_size)
	}

	fn region_path(&self, region_key: &RegionKey) -> PathBuf {
		self.save_dir.join(region_key.as_str())
	}

	pub fn region_exists(&self, region_key: &RegionKey) -> bool {
		self.region_path(region_key).is_file()
	}

	pub fn get_region(&self, region_key: &RegionKey) -> Result<RegionFile, SectorKvError> {
		RegionFile::open_or_create(
			self.region_path(region_key),
			region_key.clone(),
			self.key_model.key_count(region_key),
			self.sector_size,
			(self.columns)(),
			(self.specials)(),
		)
	}

	pub fn get_existing_region(&self, region_key: &RegionKey) -> Result<Option<RegionFile>, SectorKvError> {
		if !self.region_exists(region_key) {
			return Ok(None);
		}
		Ok(Some(self.get_region(region_key)?))
	}

	/// Lists every region file name in `save_dir` the key model recognizes.
	pub fn all_region_keys(&self) -> Result<Vec<RegionKey>, SectorKvError> {
		let mut found = Vec::new();
		if !self.save_dir.is_dir() {
			return Ok(found);
		}
		for entry in std::fs::read_dir(&self.save_dir)? {
			let entry = entry?;
			if let Some(name) = entry.file_name().to_str() {
				if let Some(region_key) = self.key_model.parse_region_file_name(name) {
					found.push(region_key);
				}
			}
		}
		Ok(found)
	}

	/// A stable identity for this factory instance (its own address), used to
	/// disambiguate `SharedCache` keys across distinct stores (spec §3).
	pub fn identity(&self) -> FactoryIdentity {
		self as *const Self as usize
	}
}

/// Rejects `data` with `UnsupportedData` if it cannot fit inline under
/// `factory`'s sector size, without ever opening or creating the region
/// file for it. Every inline `RegionProvider::write` consults this before
/// calling `get_region`/`for_region`: `RegionFile::write` performs the same
/// size check internally, but only after `open_or_create` has already
/// brought a (possibly brand-new, still-empty) region file into existence,
/// which would otherwise leave `region_exists` true for a write that never
/// actually landed — confusing `StorageFront::get`'s provider-exists
/// short-circuit into returning `None` instead of falling through to the
/// next provider.
fn check_inline_capacity(factory: &RegionFileFactory, key: &EntryKey, data: &[u8]) -> Result<(), SectorKvError> {
	if data.len() as u64 > factory.max_inline_payload_bytes() {
		return Err(SectorKvError::UnsupportedData {
			key: key.clone(),
			reason: "payload exceeds 255-sector inline capacity",
			size: data.len() as u64,
		});
	}
	Ok(())
}

/// Common key-value contract every `RegionProvider` implementation exposes
/// to `StorageFront` (spec §4.6, §4.7).
pub trait RegionProvider: Send + Sync {
	/// Writes `bytes` for `key`, or erases it if `bytes` is `None`.
	/// Fails with [`SectorKvError::UnsupportedData`] if this provider cannot
	/// hold a value this large; erasure never fails that way.
	fn write(&self, key: &EntryKey, bytes: Option<&[u8]>) -> Result<(), SectorKvError>;

	/// Reads `key`'s value. If `create_if_missing` is false and the backing
	/// region does not exist, returns `None` without touching the filesystem
	/// beyond an existence check.
	fn read(&self, key: &EntryKey, create_if_missing: bool) -> Result<Option<Vec<u8>>, SectorKvError>;

	/// Whether this provider's storage already has an open or on-disk region
	/// for `key`'s region, without forcing one into existence.
	fn region_exists(&self, region: &RegionKey) -> bool;

	/// Presence of `key`, without creating anything.
	fn has(&self, key: &EntryKey) -> Result<bool, SectorKvError>;

	/// Every key this provider currently holds, across all of its regions.
	fn all_keys(&self) -> Result<Vec<EntryKey>, SectorKvError>;
}

/// A stateless provider: opens a fresh `RegionFile` for every call and
/// closes it again immediately (spec §4.7, "stateless opener").
pub struct SimpleRegionProvider {
	factory: Arc<RegionFileFactory>,
}

impl SimpleRegionProvider {
	pub fn new(factory: Arc<RegionFileFactory>) -> Self {
		Self { factory }
	}
}

impl RegionProvider for SimpleRegionProvider {
	fn write(&self, key: &EntryKey, bytes: Option<&[u8]>) -> Result<(), SectorKvError> {
		match bytes {
			None if !self.factory.region_exists(&key.region) => Ok(()),
			None => {
				let mut region = self.factory.get_region(&key.region)?;
				region.write_null(key)?;
				region.close()
			}
			Some(data) => {
				check_inline_capacity(&self.factory, key, data)?;
				let mut region = self.factory.get_region(&key.region)?;
				region.write(key, data)?;
				region.close()
			}
		}
	}

	fn read(&self, key: &EntryKey, create_if_missing: bool) -> Result<Option<Vec<u8>>, SectorKvError> {
		let region = if create_if_missing {
			Some(self.factory.get_region(&key.region)?)
		} else {
			self.factory.get_existing_region(&key.region)?
		};
		match region {
			Some(mut region) => region.read(key),
			None => Ok(None),
		}
	}

	fn region_exists(&self, region: &RegionKey) -> bool {
		self.factory.region_exists(region)
	}

	fn has(&self, key: &EntryKey) -> Result<bool, SectorKvError> {
		match self.factory.get_existing_region(&key.region)? {
			Some(region) => Ok(region.has(key)),
			None => Ok(false),
		}
	}

	fn all_keys(&self) -> Result<Vec<EntryKey>, SectorKvError> {
		let mut out = Vec::new();
		for region_key in self.factory.all_region_keys()? {
			if let Some(region) = self.factory.get_existing_region(&region_key)? {
				region.for_each_key(|k| out.push(k));
			}
		}
		Ok(out)
	}
}

struct CacheState {
	entries: HashMap<RegionKey, RegionFile>,
	order: VecDeque<RegionKey>,
}

/// A bounded per-instance LRU of open `RegionFile`s, evicting (and closing)
/// the least-recently-touched region once `max_size` is exceeded (spec §4.7).
/// Access is serialized behind a plain mutex: this provider's whole point is
/// a single-threaded access discipline, so the lock is never contended in
/// intended use, only a uniform way to offer `&self` methods like its peers.
pub struct CachedRegionProvider {
	factory: Arc<RegionFileFactory>,
	max_size: usize,
	state: Mutex<CacheState>,
}

impl CachedRegionProvider {
	pub fn new(factory: Arc<RegionFileFactory>, max_size: usize) -> Self {
		Self {
			factory,
			max_size: max_size.max(1),
			state: Mutex::new(CacheState { entries: HashMap::new(), order: VecDeque::new() }),
		}
	}

	fn touch(state: &mut CacheState, region_key: &RegionKey) {
		state.order.retain(|k| k != region_key);
		state.order.push_back(region_key.clone());
	}

	fn evict_if_needed(&self, state: &mut CacheState) -> Result<(), SectorKvError> {
		while state.entries.len() > self.max_size {
			let Some(oldest) = state.order.pop_front() else { break };
			if let Some(region) = state.entries.remove(&oldest) {
				region.close()?;
			}
		}
		Ok(())
	}

	fn with_region<R>(
		&self,
		region_key: &RegionKey,
		allow_create: bool,
		f: impl FnOnce(&mut RegionFile) -> Result<R, SectorKvError>,
	) -> Result<Option<R>, SectorKvError> {
		let mut state = self.state.lock();
		if !state.entries.contains_key(region_key) {
			let opened = if allow_create {
				Some(self.factory.get_region(region_key)?)
			} else {
				self.factory.get_existing_region(region_key)?
			};
			let Some(region) = opened else { return Ok(None) };
			state.entries.insert(region_key.clone(), region);
		}
		Self::touch(&mut state, region_key);
		let result = f(state.entries.get_mut(region_key).unwrap())?;
		self.evict_if_needed(&mut state)?;
		Ok(Some(result))
	}
}

impl RegionProvider for CachedRegionProvider {
	fn write(&self, key: &EntryKey, bytes: Option<&[u8]>) -> Result<(), SectorKvError> {
		match bytes {
			None if !self.factory.region_exists(&key.region) => Ok(()),
			None => {
				self.with_region(&key.region, true, |region| region.write_null(key))?;
				Ok(())
			}
			Some(data) => {
				check_inline_capacity(&self.factory, key, data)?;
				self.with_region(&key.region, true, |region| region.write(key, data).map(|_| ()))?;
				Ok(())
			}
		}
	}

	fn read(&self, key: &EntryKey, create_if_missing: bool) -> Result<Option<Vec<u8>>, SectorKvError> {
		Ok(self.with_region(&key.region, create_if_missing, |region| region.read(key))?.flatten())
	}

	fn region_exists(&self, region: &RegionKey) -> bool {
		self.state.lock().entries.contains_key(region) || self.factory.region_exists(region)
	}

	fn has(&self, key: &EntryKey) -> Result<bool, SectorKvError> {
		Ok(self.with_region(&key.region, false, |region| Ok(region.has(key)))?.unwrap_or(false))
	}

	fn all_keys(&self) -> Result<Vec<EntryKey>, SectorKvError> {
		let mut out = Vec::new();
		for region_key in self.factory.all_region_keys()? {
			if let Some(keys) = self.with_region(&region_key, false, |region| {
				let mut keys = Vec::new();
				region.for_each_key(|k| keys.push(k));
				Ok(keys)
			})? {
				out.extend(keys);
			}
		}
		Ok(out)
	}
}

/// Delegates to a process-wide [`SharedCache`], keyed by `(RegionKey,
/// factory identity)` so multiple stores can safely share one cache (spec
/// §4.7, §4.8).
pub struct SharedCachedRegionProvider {
	cache: Arc<SharedCache>,
	factory: Arc<RegionFileFactory>,
}

impl SharedCachedRegionProvider {
	pub fn new(cache: Arc<SharedCache>, factory: Arc<RegionFileFactory>) -> Self {
		Self { cache, factory }
	}
}

impl RegionProvider for SharedCachedRegionProvider {
	fn write(&self, key: &EntryKey, bytes: Option<&[u8]>) -> Result<(), SectorKvError> {
		match bytes {
			None if !self.factory.region_exists(&key.region) => Ok(()),
			None => {
				self.cache.for_region(&key.region, &self.factory, true, |region| region.write_null(key))?;
				Ok(())
			}
			Some(data) => {
				check_inline_capacity(&self.factory, key, data)?;
				self.cache
					.for_region(&key.region, &self.factory, true, |region| region.write(key, data).map(|_| ()))?;
				Ok(())
			}
		}
	}

	fn read(&self, key: &EntryKey, create_if_missing: bool) -> Result<Option<Vec<u8>>, SectorKvError> {
		Ok(self
			.cache
			.for_region(&key.region, &self.factory, create_if_missing, |region| region.read(key))?
			.flatten())
	}

	fn region_exists(&self, region: &RegionKey) -> bool {
		self.factory.region_exists(region)
	}

	fn has(&self, key: &EntryKey) -> Result<bool, SectorKvError> {
		Ok(self
			.cache
			.for_region(&key.region, &self.factory, false, |region| Ok(region.has(key)))?
			.unwrap_or(false))
	}

	fn all_keys(&self) -> Result<Vec<EntryKey>, SectorKvError> {
		let mut out = Vec::new();
		for region_key in self.factory.all_region_keys()? {
			if let Some(keys) = self.cache.for_region(&region_key, &self.factory, false, |region| {
				let mut keys = Vec::new();
				region.for_each_key(|k| keys.push(k));
				Ok(keys)
			})? {
				out.extend(keys);
			}
		}
		Ok(out)
	}
}
