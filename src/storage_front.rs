//! The user-facing key-value façade: an ordered fallback chain of
//! [`RegionProvider`]s (typically `[inline, ext]`), maintaining the
//! single-writer invariant that at most one provider holds a given key at a
//! time (spec §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SectorKvError;
use crate::keymodel::EntryKey;
use crate::provider::RegionProvider;

pub struct StorageFront {
	providers: Vec<Arc<dyn RegionProvider>>,
}

impl StorageFront {
	pub fn new(providers: Vec<Arc<dyn RegionProvider>>) -> Self {
		Self { providers }
	}

	/// Writes `bytes` for `key`, walking the provider chain in order. The
	/// first provider to accept the write becomes its sole owner: every
	/// later provider is told to erase any stale copy of `key` it might
	/// hold. If every provider rejects the value with `UnsupportedData`, the
	/// accumulated causes are raised as a single [`SectorKvError::Storage`].
	pub fn put(&self, key: &EntryKey, bytes: &[u8]) -> Result<(), SectorKvError> {
		let mut to_write: Option<&[u8]> = Some(bytes);
		let mut errors = Vec::new();

		for provider in &self.providers {
			match provider.write(key, to_write) {
				Ok(()) => {
					to_write = None;
					errors.clear();
				}
				Err(e @ SectorKvError::UnsupportedData { .. }) => {
					errors.push(e);
					provider.write(key, None)?;
				}
				Err(e) => return Err(e),
			}
		}

		if errors.is_empty() {
			Ok(())
		} else {
			Err(SectorKvError::storage(format!("no provider could store key {key}"), errors))
		}
	}

	/// Batched `put`: keys that fail are left in `entries`, along with their
	/// individual causes; successfully written keys are removed. Raises a
	/// combined [`SectorKvError::MultiUnsupportedData`] iff any key failed.
	pub fn put_many(&self, entries: &mut HashMap<EntryKey, Vec<u8>>) -> Result<(), SectorKvError> {
		let mut causes: HashMap<EntryKey, Box<SectorKvError>> = HashMap::new();
		let keys: Vec<EntryKey> = entries.keys().cloned().collect();

		for key in keys {
			let bytes = entries.get(&key).expect("key came from entries.keys()").clone();
			match self.put(&key, &bytes) {
				Ok(()) => {
					entries.remove(&key);
				}
				Err(e) => {
					causes.insert(key, Box::new(e));
				}
			}
		}

		if causes.is_empty() {
			Ok(())
		} else {
			Err(SectorKvError::MultiUnsupportedData(causes))
		}
	}

	/// Reads `key`'s value, walking the provider chain in order. A provider
	/// whose region genuinely exists but does not hold `key` ends the walk
	/// with `None` rather than descending further: the single-writer
	/// invariant guarantees no other provider holds it either (spec §4.6).
	pub fn get(&self, key: &EntryKey, create_if_missing: bool) -> Result<Option<Vec<u8>>, SectorKvError> {
		for provider in &self.providers {
			let region_exists = provider.region_exists(&key.region);
			if !create_if_missing && !region_exists {
				continue;
			}
			match provider.read(key, create_if_missing)? {
				Some(bytes) => return Ok(Some(bytes)),
				None if region_exists => return Ok(None),
				None => continue,
			}
		}
		Ok(None)
	}

	/// Logical OR of `has` across providers, short-circuiting on the first hit.
	pub fn has(&self, key: &EntryKey) -> Result<bool, SectorKvError> {
		for provider in &self.providers {
			if provider.has(key)? {
				return Ok(true);
			}
		}
		Ok(false)
	}

	/// Concatenates every provider's `all_keys`. When `ensure_unique` is set,
	/// a key already seen from an earlier provider is filtered out of later
	/// providers' results (spec §4.6).
	pub fn all_keys(&self, ensure_unique: bool) -> Result<Vec<EntryKey>, SectorKvError> {
		if !ensure_unique {
			let mut out = Vec::new();
			for provider in &self.providers {
				out.extend(provider.all_keys()?);
			}
			return Ok(out);
		}

		let mut seen = std::collections::HashSet::new();
		let mut out = Vec::new();
		for provider in &self.providers {
			for key in provider.all_keys()? {
				if seen.insert(key.clone()) {
					out.push(key);
				}
			}
		}
		Ok(out)
	}

	/// `all_keys` paired with their current values, dropping any key that
	/// disappeared between enumeration and read.
	pub fn all_entries(&self, ensure_unique: bool) -> Result<Vec<(EntryKey, Vec<u8>)>, SectorKvError> {
		let mut out = Vec::new();
		for key in self.all_keys(ensure_unique)? {
			if let Some(bytes) = self.get(&key, false)? {
				out.push((key, bytes));
			}
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keymodel::{FlatKeyModel, KeyModel, RegionKey};
	use crate::provider::{RegionFileFactory, SimpleRegionProvider};
	use crate::ext_region::ExtRegionProvider;
	use tempfile::tempdir;

	fn make_front(dir: &std::path::Path) -> StorageFront {
		let key_model: Arc<dyn KeyModel> = Arc::new(FlatKeyModel);
		let inline_factory = Arc::new(RegionFileFactory::new(dir.join("region2d"), key_model.clone(), 512));
		let inline = Arc::new(SimpleRegionProvider::new(inline_factory));
		let ext = Arc::new(ExtRegionProvider::new(dir.join("region2d"), key_model, 0, || Vec::new()));
		StorageFront::new(vec![inline, ext])
	}

	#[test]
	fn put_get_roundtrip_inline() {
		let dir = tempdir().unwrap();
		let front = make_front(dir.path());
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let key = EntryKey::new(region_key, 4);
		front.put(&key, b"small value").unwrap();
		assert_eq!(front.get(&key, false).unwrap(), Some(b"small value".to_vec()));
		assert!(front.has(&key).unwrap());
	}

	#[test]
	fn oversize_put_falls_through_to_ext_and_clears_inline() {
		let dir = tempdir().unwrap();
		let front = make_front(dir.path());
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let key = EntryKey::new(region_key, 4);
		let huge = vec![7u8; 255 * 512 + 1];
		front.put(&key, &huge).unwrap();
		assert_eq!(front.get(&key, false).unwrap(), Some(huge));

		let ext_dir = dir.path().join("region2d").join("0.0.2dr.ext");
		assert!(ext_dir.join("4").is_file());
	}

	#[test]
	fn put_many_clears_successful_keys_and_keeps_failures() {
		let dir = tempdir().unwrap();
		let front = make_front(dir.path());
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let mut batch = HashMap::new();
		batch.insert(EntryKey::new(region_key.clone(), 1), b"a".to_vec());
		batch.insert(EntryKey::new(region_key, 2), b"b".to_vec());
		front.put_many(&mut batch).unwrap();
		assert!(batch.is_empty());
	}

	#[test]
	fn all_keys_ensure_unique_deduplicates() {
		let dir = tempdir().unwrap();
		let front = make_front(dir.path());
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let key = EntryKey::new(region_key, 1);
		front.put(&key, b"value").unwrap();
		let keys = front.all_keys(true).unwrap();
		assert_eq!(keys.iter().filter(|k| **k == key).count(), 1);
	}

	#[test]
	fn delete_removes_value() {
		let dir = tempdir().unwrap();
		let front = make_front(dir.path());
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let key = EntryKey::new(region_key, 1);
		front.put(&key, b"value").unwrap();
		front.providers[0].write(&key, None).unwrap();
		assert_eq!(front.get(&key, false).unwrap(), None);
	}
}
