//! One region: header + data sectors, opened as a single file. Mirrors the
//! teacher's `RegionFile` (`world/io/region/regionfile.rs`) lifecycle —
//! `open_or_create`, `write_data`, `read_data`, `delete_data` — generalized
//! to a configurable sector size, a pluggable ordered header-column list, a
//! bitmap sector tracker, and no baked-in compression (spec §6.1's wire
//! format has no compression byte).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::SectorKvError;
use crate::ioext::WriteZeroes;
use crate::keymodel::{EntryKey, RegionKey};
use crate::region::{pad_size, required_sectors};
use crate::region::header::{HeaderColumn, RegionHeader};
use crate::region::sector_location::SectorLocation;
use crate::region::sector_map::{ConflictResolution, SectorMap, SpecialEntry};
use crate::region::sector_tracker::SectorTracker;

/// The inline-storage capacity ceiling: a `SectorLocation`'s size field is a
/// single byte, so no entry can span more than 255 sectors (spec §3).
pub const MAX_INLINE_SECTORS: u32 = 255;

/// The largest payload (excluding the 4-byte length prefix) that fits inline
/// at the given sector size. Exposed so callers (e.g. `RegionFileFactory`)
/// can reject an oversized write before ever creating a region file for it.
pub fn max_inline_payload_bytes(sector_size: u32) -> u64 {
	(MAX_INLINE_SECTORS as u64 * sector_size as u64).saturating_sub(4)
}

/// One open region file: a fixed-capacity bucket of `key_count` entries.
///
/// All mutating and reading operations are serialized by construction — a
/// `&mut RegionFile` is required for every operation, so the caller (in
/// practice, `SharedCache`'s per-key exclusion) is the only synchronization
/// this type needs to rely on (spec §4.4, §5).
pub struct RegionFile {
	region_key: RegionKey,
	path: PathBuf,
	sector_size: u32,
	key_count: u32,
	stride: u64,
	header_sectors: u32,
	sector_map: SectorMap,
	header: RegionHeader,
	tracker: SectorTracker,
	file: File,
}

impl RegionFile {
	/// Opens an existing region file or creates a new, empty one at `path`.
	///
	/// `extra_columns` registers the header's optional providers (e.g. a
	/// timestamp column) in disk order, after the mandatory sector-map
	/// column. `specials` registers any [`SpecialEntry`] sentinels this
	/// region recognizes.
	pub fn open_or_create(
		path: impl AsRef<Path>,
		region_key: RegionKey,
		key_count: u32,
		sector_size: u32,
		extra_columns: Vec<Box<dyn HeaderColumn>>,
		specials: Vec<SpecialEntry>,
	) -> Result<Self, SectorKvError> {
		let path = path.as_ref().to_path_buf();
		let stride = 4 + extra_columns.iter().map(|c| c.byte_count()).sum::<usize>() as u64;
		let header_sectors = required_sectors(key_count as u64 * stride, sector_size);
		let header_bytes = header_sectors as u64 * sector_size as u64;

		let preexisting = path.is_file() && path.metadata().map(|m| m.len() >= header_bytes).unwrap_or(false);

		let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

		let mut sector_map = SectorMap::new(key_count);
		let mut header = RegionHeader::new(extra_columns, key_count);
		for special in specials {
			sector_map.register_special(special);
		}

		if preexisting {
			let mut reader = BufReader::new(&file);
			for id in 0..key_count {
				reader.seek(SeekFrom::Start(id as u64 * stride))?;
				let mut buf = [0u8; 4];
				reader.read_exact(&mut buf)?;
				sector_map.set_raw(id, u32::from_be_bytes(buf));
				header.read_id(id, &mut reader)?;
			}
			debug!(region = %region_key, "opened existing region file");
		} else {
			file.seek(SeekFrom::Start(0))?;
			file.write_zeroes(header_bytes)?;
			debug!(region = %region_key, header_sectors, "created new region file");
		}

		let tracker = SectorTracker::new(header_sectors, sector_map.iter_locations().map(|(_, loc)| loc));

		Ok(Self {
			region_key,
			path,
			sector_size,
			key_count,
			stride,
			header_sectors,
			sector_map,
			header,
			tracker,
			file,
		})
	}

	pub fn region_key(&self) -> &RegionKey {
		&self.region_key
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn key_count(&self) -> u32 {
		self.key_count
	}

	pub fn sector_size(&self) -> u32 {
		self.sector_size
	}

	fn check_key(&self, key: &EntryKey) -> Result<(), SectorKvError> {
		if key.region != self.region_key {
			return Err(SectorKvError::InvalidKey(format!(
				"key region {} does not match region file {}",
				key.region, self.region_key
			)));
		}
		if key.id >= self.key_count {
			return Err(SectorKvError::InvalidKey(format!(
				"id {} out of range (key_count={})",
				key.id, self.key_count
			)));
		}
		Ok(())
	}

	fn write_header_row(&mut self, id: u32) -> Result<(), SectorKvError> {
		let base = id as u64 * self.stride;
		self.file.seek(SeekFrom::Start(base))?;
		self.file.write_all(&self.sector_map.get_raw(id).to_be_bytes())?;
		self.header.write_id(id, base + 4, &mut self.file)?;
		Ok(())
	}

	/// Writes `bytes` for `key`, returning the [`SectorLocation`] it landed
	/// at. Diverted writes (size overflow, or a conflict handler routing the
	/// write elsewhere) fail with `UnsupportedData`, leaving prior state for
	/// this id unchanged, so `StorageFront` can fall back to the next
	/// provider (spec §4.4, §4.6).
	pub fn write(&mut self, key: &EntryKey, bytes: &[u8]) -> Result<SectorLocation, SectorKvError> {
		self.check_key(key)?;
		let id = key.id;
		let max_inline = MAX_INLINE_SECTORS as u64 * self.sector_size as u64;
		let need_bytes = bytes.len() as u64 + 4;
		if need_bytes > max_inline {
			return Err(SectorKvError::UnsupportedData {
				key: key.clone(),
				reason: "payload exceeds 255-sector inline capacity",
				size: bytes.len() as u64,
			});
		}
		let need = required_sectors(need_bytes, self.sector_size);

		let old = self.sector_map.get(id);
		let mut loc = self.tracker.reserve_for(old, need as u8)?;
		let conflict = self.sector_map.set(id, loc);

		let payload: std::borrow::Cow<[u8]> = if let Some(handler) = conflict {
			match handler(id, bytes) {
				ConflictResolution::Proceed(transformed) => {
					// The handler may have changed the payload's length, so the
					// allocation taken above (sized for `bytes`) may no longer
					// fit (or may now be larger than it needs to be). Re-derive
					// the required sector count from the transformed payload and
					// re-reserve relative to the allocation just taken, rather
					// than silently truncating it into the original-sized slot.
					let transformed_need_bytes = transformed.len() as u64 + 4;
					if transformed_need_bytes > max_inline {
						self.tracker.free(loc);
						self.sector_map.clear(id);
						self.write_header_row(id)?;
						return Err(SectorKvError::UnsupportedData {
							key: key.clone(),
							reason: "conflict-transformed payload exceeds 255-sector inline capacity",
							size: transformed.len() as u64,
						});
					}
					let transformed_need = required_sectors(transformed_need_bytes, self.sector_size);
					if transformed_need != need {
						loc = self.tracker.reserve_for(Some(loc), transformed_need as u8)?;
						// A re-reservation can only ever produce a location whose
						// raw word differs from the one already accepted by
						// `sector_map.set` above when its size or offset changes;
						// reinstall it so the on-disk header matches reality.
						self.sector_map.set(id, loc);
					}
					std::borrow::Cow::Owned(transformed)
				}
				ConflictResolution::Divert => {
					// Undo the allocation entirely; leave the id absent so
					// the fallback provider becomes the sole owner.
					self.tracker.free(loc);
					self.sector_map.clear(id);
					self.write_header_row(id)?;
					return Err(SectorKvError::UnsupportedData {
						key: key.clone(),
						reason: "sector allocation collided with a special sentinel",
						size: bytes.len() as u64,
					});
				}
			}
		} else {
			std::borrow::Cow::Borrowed(bytes)
		};

		if let Some(timestamps) = self.header.column_mut::<crate::region::header::TimestampColumn>() {
			timestamps.touch(id);
		}

		let total = loc.byte_size(self.sector_size) as usize;
		let mut buf = Vec::with_capacity(total);
		buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
		buf.extend_from_slice(&payload);
		buf.resize(total, 0);

		self.file.seek(SeekFrom::Start(loc.byte_offset(self.sector_size)))?;
		self.file.write_all(&buf)?;
		self.write_header_row(id)?;
		self.file.flush()?;
		trace!(region = %self.region_key, id, sectors = loc.size(), "wrote inline entry");
		Ok(loc)
	}

	/// Erases `key`: frees its sectors (payload bytes are left dead, not
	/// zeroed — spec §4.4) and clears its header row.
	pub fn write_null(&mut self, key: &EntryKey) -> Result<(), SectorKvError> {
		self.check_key(key)?;
		let id = key.id;
		if let Some(loc) = self.sector_map.get(id) {
			self.tracker.free(loc);
		}
		self.sector_map.clear(id);
		let base = id as u64 * self.stride;
		self.file.seek(SeekFrom::Start(base))?;
		self.file.write_all(&0u32.to_be_bytes())?;
		self.header.clear_id(id, base + 4, &mut self.file)?;
		self.file.flush()?;
		trace!(region = %self.region_key, id, "erased entry");
		Ok(())
	}

	/// Replaces `key`'s entry with a registered special marker, after
	/// freeing any sectors it previously held. Fails with `InvalidArgument`
	/// if `marker` is not registered.
	pub fn write_special(&mut self, key: &EntryKey, marker: u8) -> Result<(), SectorKvError> {
		self.check_key(key)?;
		let id = key.id;
		if let Some(loc) = self.sector_map.get(id) {
			self.tracker.free(loc);
		}
		self.sector_map.set_special(id, marker)?;
		self.write_header_row(id)?;
		self.file.flush()?;
		Ok(())
	}

	/// Reads `key`'s current value, or `None` if absent.
	pub fn read(&mut self, key: &EntryKey) -> Result<Option<Vec<u8>>, SectorKvError> {
		self.check_key(key)?;
		let id = key.id;
		if let Some(bytes) = self.sector_map.try_special_value(id) {
			return Ok(Some(bytes));
		}
		let loc = match self.sector_map.get(id) {
			Some(loc) => loc,
			None => return Ok(None),
		};
		self.file.seek(SeekFrom::Start(loc.byte_offset(self.sector_size)))?;
		let mut len_buf = [0u8; 4];
		self.file.read_exact(&mut len_buf)?;
		let len = u32::from_be_bytes(len_buf) as u64;
		let capacity = loc.byte_size(self.sector_size);
		if len + 4 > capacity {
			return Err(SectorKvError::CorruptedData {
				key: key.clone(),
				expected: format!("length <= {}", capacity - 4),
				found: len.to_string(),
			});
		}
		let mut payload = vec![0u8; len as usize];
		self.file.read_exact(&mut payload)?;
		Ok(Some(payload))
	}

	/// Presence of a sector-map entry (special or normal) for `key`.
	pub fn has(&self, key: &EntryKey) -> bool {
		if key.region != self.region_key || key.id >= self.key_count {
			return false;
		}
		self.sector_map.has(key.id)
	}

	/// Invokes `f` for every present id, in ascending order.
	pub fn for_each_key<F: FnMut(EntryKey)>(&self, mut f: F) {
		for id in self.sector_map.iter_present_ids() {
			f(EntryKey::new(self.region_key.clone(), id));
		}
	}

	/// Pads the file to a sector boundary with zeros, then fsyncs.
	pub fn flush(&mut self) -> Result<(), SectorKvError> {
		let len = self.file.metadata()?.len();
		let pad = pad_size(len, self.sector_size);
		if pad > 0 {
			self.file.seek(SeekFrom::End(0))?;
			self.file.write_zeroes(pad)?;
		}
		self.file.flush()?;
		self.file.sync_all()?;
		Ok(())
	}

	/// Flushes then releases the file handle.
	pub fn close(mut self) -> Result<(), SectorKvError> {
		self.flush()?;
		debug!(region = %self.region_key, "closed region file");
		Ok(())
	}

	pub fn header_sectors(&self) -> u32 {
		self.header_sectors
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::region::header::TimestampColumn;
	use tempfile::tempdir;

	fn key(region: &RegionKey, id: u32) -> EntryKey {
		EntryKey::new(region.clone(), id)
	}

	#[test]
	fn write_read_roundtrip() {
		let dir = tempdir().unwrap();
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let mut region = RegionFile::open_or_create(
			dir.path().join("0.0.2dr"),
			region_key.clone(),
			1024,
			512,
			vec![],
			vec![],
		)
		.unwrap();

		let k = key(&region_key, 7);
		let payload = b"hello region file".to_vec();
		region.write(&k, &payload).unwrap();
		assert_eq!(region.read(&k).unwrap(), Some(payload));
		assert!(region.has(&k));
	}

	#[test]
	fn write_then_delete_then_absent() {
		let dir = tempdir().unwrap();
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let mut region =
			RegionFile::open_or_create(dir.path().join("r"), region_key.clone(), 16, 512, vec![], vec![]).unwrap();
		let k = key(&region_key, 1);
		region.write(&k, b"data").unwrap();
		region.write_null(&k).unwrap();
		assert_eq!(region.read(&k).unwrap(), None);
		assert!(!region.has(&k));
	}

	#[test]
	fn overwrite_replaces_value() {
		let dir = tempdir().unwrap();
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let mut region =
			RegionFile::open_or_create(dir.path().join("r"), region_key.clone(), 16, 512, vec![], vec![]).unwrap();
		let k = key(&region_key, 1);
		region.write(&k, b"version one").unwrap();
		region.write(&k, b"version two, a little longer").unwrap();
		assert_eq!(region.read(&k).unwrap(), Some(b"version two, a little longer".to_vec()));
	}

	#[test]
	fn grow_without_move_when_room_follows() {
		let dir = tempdir().unwrap();
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let mut region =
			RegionFile::open_or_create(dir.path().join("r"), region_key.clone(), 16, 512, vec![], vec![]).unwrap();
		let k0 = key(&region_key, 0);
		let loc1 = region.write(&k0, &[0u8; 10]).unwrap(); // 1 sector
		assert_eq!(loc1.size(), 1);
		// Grow to 3 sectors; the next 2 sectors are free (nothing else allocated).
		let loc2 = region.write(&k0, &[1u8; 1200]).unwrap(); // needs 3 sectors of 512
		assert_eq!(loc2.offset(), loc1.offset());
		assert_eq!(loc2.size(), 3);
	}

	#[test]
	fn oversize_rejected_as_unsupported() {
		let dir = tempdir().unwrap();
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let mut region =
			RegionFile::open_or_create(dir.path().join("r"), region_key.clone(), 16, 512, vec![], vec![]).unwrap();
		let k = key(&region_key, 0);
		let huge = vec![0u8; 255 * 512];
		let err = region.write(&k, &huge).unwrap_err();
		assert!(matches!(err, SectorKvError::UnsupportedData { .. }));
	}

	#[test]
	fn restart_durability_after_flush() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("r");
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		{
			let mut region = RegionFile::open_or_create(
				&path,
				region_key.clone(),
				16,
				512,
				vec![Box::new(TimestampColumn::new(16))],
				vec![],
			)
			.unwrap();
			let k = key(&region_key, 3);
			region.write(&k, b"durable payload").unwrap();
			region.flush().unwrap();
		}
		let mut reopened = RegionFile::open_or_create(
			&path,
			region_key.clone(),
			16,
			512,
			vec![Box::new(TimestampColumn::new(16))],
			vec![],
		)
		.unwrap();
		let k = key(&region_key, 3);
		assert_eq!(reopened.read(&k).unwrap(), Some(b"durable payload".to_vec()));
	}

	#[test]
	fn for_each_key_lists_present_ids_only() {
		let dir = tempdir().unwrap();
		let region_key = RegionKey::new("0.0.2dr").unwrap();
		let mut region =
			RegionFile::open_or_create(dir.path().join("r"), region_key.clone(), 16, 512, vec![], vec![]).unwrap();
		region.write(&key(&region_key, 2), b"a").unwrap();
		region.write(&key(&region_key, 9), b"b").unwrap();
		let mut seen = Vec::new();
		region.for_each_key(|k| seen.push(k.id));
		assert_eq!(seen, vec![2, 9]);
	}
}
