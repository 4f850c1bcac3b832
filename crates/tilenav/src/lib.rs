//! Tiled navigation mesh runtime.
//!
//! A [`NavMesh`] stitches rectangular tiles of convex polygons into one
//! logical graph. Tiles are built externally into binary payloads (see
//! [`create_nav_mesh_data`]), added with [`NavMesh::add_tile`] and
//! addressed through opaque, salted [`PolyRef`]/[`TileRef`] handles that
//! stay stable across unrelated tile churn.

mod builder;
mod nav_mesh;
mod nav_mesh_stitch_tests;
mod ref_codec;
mod status;
mod tile_data;

pub use builder::{create_nav_mesh_data, NavMeshCreateParams, MESH_NULL_IDX};
pub use nav_mesh::{MeshTile, NavMesh, NavMeshParams};
pub use ref_codec::{PolyRef, RefCodec, TileRef};
pub use status::{Result, Status};
pub use tile_data::{
    BvNode, Link, MeshHeader, OffMeshConnection, Poly, PolyDetail, PolyFlags, PolyType, TileData,
    TileFlags, NAVMESH_MAGIC, NAVMESH_STATE_MAGIC, NAVMESH_STATE_VERSION, NAVMESH_VERSION,
};

/// Maximum number of vertices per navigation polygon.
pub const VERTS_PER_POLY: usize = 6;

/// Neighbour-code bit marking a portal edge; the low byte carries the
/// compass direction.
pub const EXT_LINK: u16 = 0x8000;

/// Sentinel terminating link chains.
pub const NULL_LINK: u32 = u32::MAX;

/// Off-mesh connection flag: traversable in both directions.
pub const OFFMESH_CON_BIDIR: u8 = 0x01;

/// Detail-triangle edge flag marking an edge on the polygon boundary.
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x01;
