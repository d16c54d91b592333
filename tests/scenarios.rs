//! On-disk integration tests for the scenarios named in the crate's
//! testable-properties section: simple roundtrip, interleaved
//! write/read, oversize fallback (single and batched), and cache eviction.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use sectorkv::{
	CachedRegionProvider, EntryKey, ExtRegionProvider, KeyModel, RegionFile, RegionFileFactory, RegionKey,
	RegionProvider, SharedCache, SharedCachedRegionProvider, SimpleRegionProvider, StorageFront, VoxelKeyModel,
};

fn voxel_region_and_id(model: &VoxelKeyModel, ex: i32, ey: i32, ez: i32) -> (RegionKey, u32) {
	(model.region_key_for(ex, ey, ez), model.id_for(ex, ey, ez))
}

#[test]
fn s1_simple_roundtrip_after_reopen() {
	let dir = tempdir().unwrap();
	let model = VoxelKeyModel;
	let (region_key, id) = voxel_region_and_id(&model, 0, 0, 0);
	let path = dir.path().join(region_key.as_str());
	let payload: Vec<u8> = (0u8..10).collect();

	{
		let mut region =
			RegionFile::open_or_create(&path, region_key.clone(), model.key_count(&region_key), 512, vec![], vec![]).unwrap();
		let key = EntryKey::new(region_key.clone(), id);
		region.write(&key, &payload).unwrap();
		region.close().unwrap();
	}

	let mut reopened =
		RegionFile::open_or_create(&path, region_key.clone(), model.key_count(&region_key), 512, vec![], vec![]).unwrap();
	let key = EntryKey::new(region_key, id);
	assert_eq!(reopened.read(&key).unwrap(), Some(payload));
}

#[test]
fn s2_interleaved_random_writes_stay_consistent() {
	let dir = tempdir().unwrap();
	let model = VoxelKeyModel;
	let region_key = RegionKey::new("0.0.0.3dr").unwrap();
	let path = dir.path().join(region_key.as_str());
	let mut region =
		RegionFile::open_or_create(&path, region_key.clone(), model.key_count(&region_key), 512, vec![], vec![]).unwrap();

	let mut rng = StdRng::seed_from_u64(42);
	let mut live: HashMap<u32, Vec<u8>> = HashMap::new();

	for _ in 0..1000 {
		let (ex, ey, ez) = (rng.gen_range(0..5), rng.gen_range(0..5), rng.gen_range(0..5));
		let id = model.id_for(ex, ey, ez);
		let len = rng.gen_range(1..200);
		let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

		let key = EntryKey::new(region_key.clone(), id);
		region.write(&key, &payload).unwrap();
		live.insert(id, payload);

		for (&live_id, expected) in &live {
			let key = EntryKey::new(region_key.clone(), live_id);
			assert_eq!(region.read(&key).unwrap().as_ref(), Some(expected));
		}
	}
}

fn make_storage_front(save_dir: &std::path::Path, key_model: Arc<dyn KeyModel>) -> StorageFront {
	let inline_factory = Arc::new(RegionFileFactory::new(save_dir, key_model.clone(), 512));
	let inline = Arc::new(SimpleRegionProvider::new(inline_factory));
	let ext = Arc::new(ExtRegionProvider::new(save_dir, key_model, 0, Vec::new));
	StorageFront::new(vec![inline, ext])
}

#[test]
fn s3_oversize_single_put_falls_back_to_ext_region() {
	let dir = tempdir().unwrap();
	let key_model: Arc<dyn KeyModel> = Arc::new(VoxelKeyModel);
	let front = make_storage_front(dir.path(), key_model.clone());

	let region_key = RegionKey::new("0.0.0.3dr").unwrap();
	let key = EntryKey::new(region_key.clone(), 0);
	let huge = vec![0xABu8; 256 * 1024 * 1024];

	front.put(&key, &huge).unwrap();
	assert_eq!(front.get(&key, false).unwrap(), Some(huge));
	assert!(dir.path().join(format!("{region_key}.ext")).join("0").is_file());
}

#[test]
fn s4_batch_fallback_clears_map_and_reads_back() {
	let dir = tempdir().unwrap();
	let key_model: Arc<dyn KeyModel> = Arc::new(VoxelKeyModel);
	let front = make_storage_front(dir.path(), key_model);

	let region_key = RegionKey::new("0.0.0.3dr").unwrap();
	let key = EntryKey::new(region_key, 0);
	let huge = vec![0x7Fu8; 256 * 1024 * 1024];

	let mut batch = HashMap::new();
	batch.insert(key.clone(), huge.clone());
	front.put_many(&mut batch).unwrap();

	assert!(batch.is_empty());
	assert_eq!(front.get(&key, false).unwrap(), Some(huge));
}

#[test]
fn s5_cache_eviction_reopens_correctly() {
	let dir = tempdir().unwrap();
	let key_model: Arc<dyn KeyModel> = Arc::new(VoxelKeyModel);
	let factory = Arc::new(RegionFileFactory::new(dir.path(), key_model, 512));
	let cache = Arc::new(SharedCache::new(4));
	let provider = SharedCachedRegionProvider::new(cache.clone(), factory);

	let mut written = Vec::new();
	for i in 0..10 {
		let region_key = RegionKey::new(format!("{i}.0.0.3dr")).unwrap();
		let key = EntryKey::new(region_key, 0);
		let payload = vec![i as u8; 4];
		provider.write(&key, Some(&payload)).unwrap();
		written.push((key, payload));
	}

	assert!(cache.len() <= 4, "cache should stay within max_size, was {}", cache.len());

	for (key, payload) in &written {
		assert_eq!(provider.read(key, false).unwrap().as_ref(), Some(payload));
	}
}

#[test]
fn cached_region_provider_also_evicts_and_reopens() {
	let dir = tempdir().unwrap();
	let key_model: Arc<dyn KeyModel> = Arc::new(VoxelKeyModel);
	let factory = Arc::new(RegionFileFactory::new(dir.path(), key_model, 512));
	let provider = CachedRegionProvider::new(factory, 2);

	let mut written = Vec::new();
	for i in 0..6 {
		let region_key = RegionKey::new(format!("{i}.0.0.3dr")).unwrap();
		let key = EntryKey::new(region_key, 0);
		let payload = vec![i as u8; 4];
		provider.write(&key, Some(&payload)).unwrap();
		written.push((key, payload));
	}

	for (key, payload) in &written {
		assert_eq!(provider.read(key, false).unwrap().as_ref(), Some(payload));
	}
}
