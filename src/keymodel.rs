//! Region identity and per-region key addressing.
//!
//! The engine itself only ever deals in [`RegionKey`] (an opaque, validated
//! filesystem-safe name) and [`EntryKey`] (a region key paired with an `id`
//! in `0..key_count`). How a particular world model maps its own coordinate
//! space onto those two types is the concern of a [`KeyModel`] implementation,
//! not of the storage engine.

use std::fmt;
use std::sync::Arc;

use crate::error::SectorKvError;

/// An immutable, validated region identifier: `[a-z0-9._-]+`, unique per
/// region, safe to use as a filesystem name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey(Arc<str>);

impl RegionKey {
	/// Validates and wraps `s` as a [`RegionKey`].
	pub fn new(s: impl AsRef<str>) -> Result<Self, SectorKvError> {
		let s = s.as_ref();
		if is_valid_region_name(s) {
			Ok(RegionKey(Arc::from(s)))
		} else {
			Err(SectorKvError::InvalidRegionName(s.to_owned()))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RegionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<str> for RegionKey {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// `[a-z0-9._-]+`, matching the property every [`KeyModel`] region name must
/// satisfy in order to be safely usable as a filesystem entry.
pub fn is_valid_region_name(s: &str) -> bool {
	!s.is_empty()
		&& s.bytes().all(|b| {
			b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
		})
}

/// An immutable tuple `(region, id)` where `0 <= id < key_count(region)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
	pub region: RegionKey,
	pub id: u32,
}

impl EntryKey {
	pub fn new(region: RegionKey, id: u32) -> Self {
		Self { region, id }
	}
}

impl fmt::Display for EntryKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.region, self.id)
	}
}

/// Capability that defines region identity and per-key addressing for a
/// particular world model. Region storage is parameterized by `KeyModel`,
/// not by the key type itself.
pub trait KeyModel: Send + Sync {
	/// The number of addressable ids in `region` under this model (spec
	/// §4.1: "constant per region" — every archetype shipped here returns
	/// the same value regardless of `region`, but the capability takes the
	/// region key so a model whose capacity genuinely varies per region can
	/// honor it without changing the trait).
	fn key_count(&self, region: &RegionKey) -> u32;

	/// Parses an external `(region_key, id)` pair, failing with
	/// [`SectorKvError::InvalidKey`] if the region name or id is out of range.
	fn from_region_and_id(&self, region: RegionKey, id: u32) -> Result<EntryKey, SectorKvError> {
		let key_count = self.key_count(&region);
		if id >= key_count {
			return Err(SectorKvError::InvalidKey(format!(
				"id {id} out of range for region {region} (key_count={key_count})"
			)));
		}
		Ok(EntryKey::new(region, id))
	}

	/// Whether `s` is a region name this model recognizes (used by
	/// `SimpleRegionProvider::all_regions` to filter directory listings).
	fn is_region_file_name(&self, s: &str) -> bool;

	/// Parses a region key out of a file name this model produced, if `s`
	/// matches its naming scheme.
	fn parse_region_file_name(&self, s: &str) -> Option<RegionKey>;
}

/// The archetypal flat (2D) region model: `X.Z.2dr`, 32x32 ids per region,
/// `id = (ex & 31) << 5 | (ez & 31)` (spec §6.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatKeyModel;

impl FlatKeyModel {
	pub const REGION_SIDE: i32 = 32;

	pub fn region_key_for(&self, ex: i32, ez: i32) -> RegionKey {
		let (rx, rz) = (ex >> 5, ez >> 5);
		RegionKey::new(format!("{rx}.{rz}.2dr")).expect("generated region names are always valid")
	}

	pub fn id_for(&self, ex: i32, ez: i32) -> u32 {
		(((ex & 31) as u32) << 5) | ((ez & 31) as u32)
	}
}

impl KeyModel for FlatKeyModel {
	fn key_count(&self, _region: &RegionKey) -> u32 {
		1024
	}

	fn is_region_file_name(&self, s: &str) -> bool {
		self.parse_region_file_name(s).is_some()
	}

	fn parse_region_file_name(&self, s: &str) -> Option<RegionKey> {
		let rest = s.strip_suffix(".2dr")?;
		let mut parts = rest.splitn(2, '.');
		let rx = parts.next()?.parse::<i32>().ok()?;
		let rz = parts.next()?.parse::<i32>().ok()?;
		let _ = (rx, rz);
		RegionKey::new(s).ok()
	}
}

/// The archetypal voxel (3D) region model: `X.Y.Z.3dr`, 32x32x32 ids per
/// region, `id = (ex&31)<<10 | (ey&31)<<5 | (ez&31)` (spec §6.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct VoxelKeyModel;

impl VoxelKeyModel {
	pub fn region_key_for(&self, ex: i32, ey: i32, ez: i32) -> RegionKey {
		let (rx, ry, rz) = (ex >> 5, ey >> 5, ez >> 5);
		RegionKey::new(format!("{rx}.{ry}.{rz}.3dr")).expect("generated region names are always valid")
	}

	pub fn id_for(&self, ex: i32, ey: i32, ez: i32) -> u32 {
		(((ex & 31) as u32) << 10) | (((ey & 31) as u32) << 5) | ((ez & 31) as u32)
	}
}

impl KeyModel for VoxelKeyModel {
	fn key_count(&self, _region: &RegionKey) -> u32 {
		32 * 32 * 32
	}

	fn is_region_file_name(&self, s: &str) -> bool {
		self.parse_region_file_name(s).is_some()
	}

	fn parse_region_file_name(&self, s: &str) -> Option<RegionKey> {
		let rest = s.strip_suffix(".3dr")?;
		let mut parts = rest.splitn(3, '.');
		parts.next()?.parse::<i32>().ok()?;
		parts.next()?.parse::<i32>().ok()?;
		parts.next()?.parse::<i32>().ok()?;
		RegionKey::new(s).ok()
	}
}

/// The Minecraft Anvil region model: `r.X.Z.mca`, 32x32 ids per region.
///
/// Note the id packing is `(ez & 31) << 5 | (ex & 31)` — the reverse of
/// [`FlatKeyModel`]'s `(ex<<5)|ez`. The source engine's history mixes both
/// conventions across revisions for this exact format; this model pins the
/// `(z<<5)|x` convention to match on-disk Anvil region files in the wild.
#[derive(Debug, Clone, Copy, Default)]
pub struct McaKeyModel;

impl McaKeyModel {
	pub fn region_key_for(&self, ex: i32, ez: i32) -> RegionKey {
		let (rx, rz) = (ex >> 5, ez >> 5);
		RegionKey::new(format!("r.{rx}.{rz}.mca")).expect("generated region names are always valid")
	}

	pub fn id_for(&self, ex: i32, ez: i32) -> u32 {
		(((ez & 31) as u32) << 5) | ((ex & 31) as u32)
	}
}

impl KeyModel for McaKeyModel {
	fn key_count(&self, _region: &RegionKey) -> u32 {
		1024
	}

	fn is_region_file_name(&self, s: &str) -> bool {
		self.parse_region_file_name(s).is_some()
	}

	fn parse_region_file_name(&self, s: &str) -> Option<RegionKey> {
		let rest = s.strip_prefix("r.")?.strip_suffix(".mca")?;
		let mut parts = rest.splitn(2, '.');
		parts.next()?.parse::<i32>().ok()?;
		parts.next()?.parse::<i32>().ok()?;
		RegionKey::new(s).ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn region_key_rejects_invalid_names() {
		assert!(RegionKey::new("R.0.0.mca").is_err());
		assert!(RegionKey::new("").is_err());
		assert!(RegionKey::new("r.0.0.mca").is_ok());
	}

	#[test]
	fn flat_key_model_ids() {
		let model = FlatKeyModel;
		assert_eq!(model.id_for(0, 0), 0);
		assert_eq!(model.id_for(31, 0), 31 << 5);
		assert_eq!(model.id_for(0, 31), 31);
		assert_eq!(model.region_key_for(32, 0).as_str(), "1.0.2dr");
		assert_eq!(model.region_key_for(-1, 0).as_str(), "-1.0.2dr");
	}

	#[test]
	fn mca_key_model_reversed_packing() {
		let model = McaKeyModel;
		// (ez<<5)|ex, not (ex<<5)|ez
		assert_eq!(model.id_for(3, 5), (5 << 5) | 3);
	}

	#[test]
	fn voxel_key_model_ids() {
		let model = VoxelKeyModel;
		assert_eq!(model.id_for(1, 2, 3), (1 << 10) | (2 << 5) | 3);
		assert_eq!(model.key_count(&model.region_key_for(1, 2, 3)), 32768);
	}
}
