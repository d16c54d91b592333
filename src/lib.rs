pub mod error;
pub mod ext_region;
pub mod ioext;
pub mod keymodel;
pub mod provider;
pub mod region;
pub mod shared_cache;
pub mod storage_front;

pub use error::{SectorKvError, SectorKvResult};
pub use ext_region::{ExtRegion, ExtRegionProvider};
pub use keymodel::{EntryKey, FlatKeyModel, KeyModel, McaKeyModel, RegionKey, VoxelKeyModel};
pub use provider::{CachedRegionProvider, RegionFileFactory, RegionProvider, SharedCachedRegionProvider, SimpleRegionProvider};
pub use region::header::{FixedBlobColumn, HeaderColumn, RegionHeader, TimestampColumn};
pub use region::region_file::RegionFile;
pub use region::sector_location::SectorLocation;
pub use region::sector_map::{ConflictResolution, SectorMap, SpecialEntry};
pub use region::sector_tracker::SectorTracker;
pub use shared_cache::SharedCache;
pub use storage_front::StorageFront;
