//! Obstacle-aware tile cache for the tilenav navigation mesh.
//!
//! The cache keeps a compressed layer per tile and a set of dynamic
//! obstacles (cylinders, boxes, rotated boxes). Adding or removing an
//! obstacle queues a request; [`TileCache::update`] incrementally
//! rebuilds the affected tiles and replaces them in the live
//! [`tilenav::NavMesh`].

mod builder;
mod layer;
mod tile_cache;
mod tile_cache_update_tests;

pub use builder::{
    mark_box_area, mark_cylinder_area, mark_oriented_box_area, BuildScratch, GridMesher,
    LayerMesher, LayerPolyMesh, MeshProcess,
};
pub use layer::{
    build_tile_cache_layer, decompress_tile_cache_layer, LayerHeader, Lz4Compressor,
    TileCacheLayer, TileCompressor, TILECACHE_MAGIC, TILECACHE_VERSION,
};
pub use tile_cache::{
    CompressedTile, CompressedTileFlags, CompressedTileRef, Obstacle, ObstacleGeometry,
    ObstacleRef, ObstacleState, TileCache, TileCacheParams, MAX_REQUESTS, MAX_TOUCHED_TILES,
    MAX_UPDATE,
};
