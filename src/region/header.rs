//! The region header's optional columns — everything after the mandatory
//! sector-map column, which [`crate::region::sector_map::SectorMap`] owns and
//! serializes itself since it is never optional and carries special-entry
//! semantics the generic column machinery doesn't need to know about.
//!
//! Layout (spec §3, §4.4): `H_stride = 4 (sector map) + sum(extra column
//! byte_count)`; header occupies `ceil(N * H_stride / sector_size)` sectors;
//! for id `i`, the sector-map word lives at `i*H_stride`, and each extra
//! column's entry follows at `i*H_stride + 4 + prefix`.

use std::any::Any;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::SectorKvError;

/// A fixed-width column of per-id header data, registered after the
/// mandatory sector-map column.
pub trait HeaderColumn: Any + Send + Sync {
	/// Width in bytes of this column's entry for a single id.
	fn byte_count(&self) -> usize;

	/// Reads this column's entry for `id` from `reader`, which is already
	/// positioned at the start of the entry.
	fn read_entry(&mut self, id: u32, reader: &mut dyn Read) -> Result<(), SectorKvError>;

	/// Writes this column's current in-memory entry for `id` to `writer`,
	/// which is already positioned at the start of the entry.
	fn write_entry(&self, id: u32, writer: &mut dyn Write) -> Result<(), SectorKvError>;

	/// Resets this column's entry for `id` to its default (all-zero) value.
	fn clear_entry(&mut self, writer: &mut dyn Write) -> Result<(), SectorKvError> {
		writer.write_all(&vec![0u8; self.byte_count()])?;
		Ok(())
	}

	fn as_any(&self) -> &dyn Any;
	fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Optional column: 4 bytes/id, big-endian Unix time in the configured unit
/// (archetypally seconds), grounded on the teacher's `Timestamp` column.
pub struct TimestampColumn {
	pub values: Vec<u32>,
}

impl TimestampColumn {
	pub fn new(key_count: u32) -> Self {
		Self { values: vec![0u32; key_count as usize] }
	}

	/// Stamps `id` with the current time (Unix seconds, truncated to `u32`),
	/// called by `RegionFile::write` just before the header row is rewritten.
	pub fn touch(&mut self, id: u32) {
		self.values[id as usize] = chrono::Utc::now().timestamp() as u32;
	}
}

impl HeaderColumn for TimestampColumn {
	fn byte_count(&self) -> usize {
		4
	}

	fn read_entry(&mut self, id: u32, reader: &mut dyn Read) -> Result<(), SectorKvError> {
		let mut buf = [0u8; 4];
		reader.read_exact(&mut buf)?;
		self.values[id as usize] = u32::from_be_bytes(buf);
		Ok(())
	}

	fn write_entry(&self, id: u32, writer: &mut dyn Write) -> Result<(), SectorKvError> {
		writer.write_all(&self.values[id as usize].to_be_bytes())?;
		Ok(())
	}

	fn as_any(&self) -> &dyn Any { self }
	fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

/// An optional, user-defined fixed-width column of `N` bytes/id, realizing
/// spec §3's "optional user-defined fixed-width blobs".
pub struct FixedBlobColumn<const N: usize> {
	pub values: Vec<[u8; N]>,
}

impl<const N: usize> FixedBlobColumn<N> {
	pub fn new(key_count: u32) -> Self {
		Self { values: vec![[0u8; N]; key_count as usize] }
	}
}

impl<const N: usize> HeaderColumn for FixedBlobColumn<N> {
	fn byte_count(&self) -> usize {
		N
	}

	fn read_entry(&mut self, id: u32, reader: &mut dyn Read) -> Result<(), SectorKvError> {
		reader.read_exact(&mut self.values[id as usize])?;
		Ok(())
	}

	fn write_entry(&self, id: u32, writer: &mut dyn Write) -> Result<(), SectorKvError> {
		writer.write_all(&self.values[id as usize])?;
		Ok(())
	}

	fn as_any(&self) -> &dyn Any { self }
	fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

/// The registered, ordered list of extra header columns for a region
/// (everything after the sector-map column), plus the derived layout.
pub struct RegionHeader {
	pub columns: Vec<Box<dyn HeaderColumn>>,
	pub key_count: u32,
}

impl RegionHeader {
	pub fn new(columns: Vec<Box<dyn HeaderColumn>>, key_count: u32) -> Self {
		Self { columns, key_count }
	}

	pub fn empty(key_count: u32) -> Self {
		Self { columns: Vec::new(), key_count }
	}

	/// Sum of extra columns' byte_count (excludes the 4-byte sector-map word).
	pub fn extra_stride(&self) -> usize {
		self.columns.iter().map(|c| c.byte_count()).sum()
	}

	/// Borrows a registered column by concrete type, if present.
	pub fn column<T: HeaderColumn + 'static>(&self) -> Option<&T> {
		self.columns.iter().find_map(|c| c.as_any().downcast_ref::<T>())
	}

	/// Mutably borrows a registered column by concrete type, if present.
	pub fn column_mut<T: HeaderColumn + 'static>(&mut self) -> Option<&mut T> {
		self.columns.iter_mut().find_map(|c| c.as_any_mut().downcast_mut::<T>())
	}

	/// Byte offset (relative to the start of the extra-columns region for id
	/// `id`, i.e. after the 4-byte sector word) of column `column_idx`'s entry.
	fn entry_prefix(&self, column_idx: usize) -> usize {
		self.columns[..column_idx].iter().map(|c| c.byte_count()).sum()
	}

	/// Reads every extra column's entry for `id` from `reader`, which must be
	/// positioned at the start of the extra-columns area for this id (i.e.
	/// immediately after the 4-byte sector-map word).
	pub fn read_id<R: Read>(&mut self, id: u32, reader: &mut R) -> Result<(), SectorKvError> {
		for column in self.columns.iter_mut() {
			column.read_entry(id, reader)?;
		}
		Ok(())
	}

	/// Writes every extra column's current value for `id`, each positioned
	/// independently so a partial write touches bounded bytes per column
	/// (spec §4.4 "Header write").
	pub fn write_id<W: Write + Seek>(&self, id: u32, base_offset: u64, writer: &mut W) -> Result<(), SectorKvError> {
		for (idx, column) in self.columns.iter().enumerate() {
			writer.seek(SeekFrom::Start(base_offset + self.entry_prefix(idx) as u64))?;
			column.write_entry(id, writer)?;
		}
		Ok(())
	}

	/// Zeroes every extra column's entry for `id`.
	pub fn clear_id<W: Write + Seek>(&mut self, id: u32, base_offset: u64, writer: &mut W) -> Result<(), SectorKvError> {
		for (idx, column) in self.columns.iter_mut().enumerate() {
			writer.seek(SeekFrom::Start(base_offset + self.entry_prefix(idx) as u64))?;
			column.clear_entry(writer)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn extra_stride_sums_columns() {
		let columns: Vec<Box<dyn HeaderColumn>> = vec![
			Box::new(TimestampColumn::new(8)),
			Box::new(FixedBlobColumn::<2>::new(8)),
		];
		let header = RegionHeader::new(columns, 8);
		assert_eq!(header.extra_stride(), 6);
	}

	#[test]
	fn write_then_read_id_roundtrip() {
		let key_count = 4;
		let mut header = RegionHeader::new(vec![Box::new(TimestampColumn::new(key_count))], key_count);
		header.column_mut::<TimestampColumn>().unwrap().values[2] = 0xAABBCCDD;

		let mut buf = Cursor::new(vec![0u8; 64]);
		header.write_id(2, 16, &mut buf).unwrap();

		buf.set_position(16);
		let mut header2 = RegionHeader::new(vec![Box::new(TimestampColumn::new(key_count))], key_count);
		header2.read_id(2, &mut buf).unwrap();
		assert_eq!(header2.column::<TimestampColumn>().unwrap().values[2], 0xAABBCCDD);
	}
}
