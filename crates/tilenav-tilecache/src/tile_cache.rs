//! Obstacle-aware tile cache.
//!
//! The cache keeps compressed layers for every tile column plus a salted
//! slot array of obstacles. Obstacle edits are queued as requests; each
//! [`TileCache::update`] call drains the queue, then rebuilds at most one
//! affected tile and swaps it into the live [`NavMesh`], so the caller
//! can cap per-frame work by bounding the number of calls.

use tilenav::{
    create_nav_mesh_data, NavMesh, NavMeshCreateParams, Result, Status, TileFlags, TileRef,
};
use tilenav_common::{ilog2, next_pow2, overlap_bounds};

use super::builder::{
    mark_box_area, mark_cylinder_area, mark_oriented_box_area, BuildScratch, LayerMesher,
    MeshProcess,
};
use super::layer::{decompress_tile_cache_layer, LayerHeader, TileCompressor};

/// Capacity of the obstacle request queue.
pub const MAX_REQUESTS: usize = 64;

/// Capacity of the pending rebuild list.
pub const MAX_UPDATE: usize = 64;

/// Most tiles one obstacle can touch.
pub const MAX_TOUCHED_TILES: usize = 8;

/// Most tiles returned per column lookup.
const MAX_TILES_PER_COLUMN: usize = 32;

/// Opaque reference to a compressed tile in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CompressedTileRef(u32);

impl CompressedTileRef {
    /// The null reference.
    pub const NULL: CompressedTileRef = CompressedTileRef(0);

    /// Returns true if this is the null reference.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw identifier value.
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Opaque reference to an obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ObstacleRef(u32);

impl ObstacleRef {
    /// The null reference.
    pub const NULL: ObstacleRef = ObstacleRef(0);

    /// Returns true if this is the null reference.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw identifier value.
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }
}

bitflags::bitflags! {
    /// Flags for compressed tiles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompressedTileFlags: u8 {
        /// The cache owns the payload and drops it on removal.
        const FREE_DATA = 0x01;
    }
}

/// Configuration for a tile cache.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileCacheParams {
    /// World-space origin of the tile grid.
    pub orig: [f32; 3],
    /// Cell size and height of the layers.
    pub cs: f32,
    pub ch: f32,
    /// Layer grid dimensions per tile, in cells.
    pub width: i32,
    pub height: i32,
    /// Agent parameters handed to rebuilt tiles.
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Slot capacities.
    pub max_tiles: i32,
    pub max_obstacles: i32,
}

/// State of an obstacle slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ObstacleState {
    /// Free slot.
    Empty,
    /// Added; some touched tiles still await rebuild.
    Processing,
    /// Added and fully reflected in the mesh.
    Processed,
    /// Removal requested; some touched tiles still await rebuild.
    Removing,
}

/// Geometry of an obstacle.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ObstacleGeometry {
    /// Vertical cylinder standing on `pos`.
    Cylinder {
        pos: [f32; 3],
        radius: f32,
        height: f32,
    },
    /// Axis-aligned box.
    Box { bmin: [f32; 3], bmax: [f32; 3] },
    /// Box rotated around the y-axis; `rot_aux` holds the half-angle
    /// auxiliaries used by the rasteriser.
    OrientedBox {
        center: [f32; 3],
        half_extents: [f32; 3],
        rot_aux: [f32; 2],
    },
}

/// An obstacle slot.
#[derive(Debug, Clone)]
pub struct Obstacle {
    pub geometry: ObstacleGeometry,
    pub state: ObstacleState,
    /// Generation counter.
    pub salt: u16,
    /// Tiles containing the obstacle.
    pub touched: Vec<CompressedTileRef>,
    /// Subset of `touched` still awaiting rebuild.
    pub pending: Vec<CompressedTileRef>,
    next: Option<u32>,
}

impl Default for Obstacle {
    fn default() -> Self {
        Self {
            geometry: ObstacleGeometry::Cylinder {
                pos: [0.0; 3],
                radius: 0.0,
                height: 0.0,
            },
            state: ObstacleState::Empty,
            salt: 1,
            touched: Vec::new(),
            pending: Vec::new(),
            next: None,
        }
    }
}

/// A compressed tile slot.
#[derive(Debug, Default)]
pub struct CompressedTile {
    /// Generation counter.
    pub salt: u32,
    /// Header of the resident payload, `None` while the slot is free.
    pub header: Option<LayerHeader>,
    /// Full payload blob (header plus compressed grids).
    pub(crate) data: Vec<u8>,
    pub flags: CompressedTileFlags,
    /// Hash-bucket chain while occupied, free-list chain while free.
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy)]
struct ObstacleRequest {
    action: RequestAction,
    obstacle: ObstacleRef,
}

/// Reference codec for compressed tiles: (salt, tile index) in a `u32`.
#[derive(Debug, Clone, Copy)]
struct CacheRefCodec {
    tile_bits: u32,
    salt_bits: u32,
}

impl CacheRefCodec {
    fn new(max_tiles: u32) -> Result<Self> {
        let tile_bits = ilog2(next_pow2(max_tiles));
        let salt_bits = 32 - tile_bits;
        if salt_bits < 10 {
            return Err(Status::InvalidParam);
        }
        Ok(Self {
            tile_bits,
            salt_bits: salt_bits.min(31),
        })
    }

    #[inline]
    fn encode(&self, salt: u32, it: u32) -> CompressedTileRef {
        CompressedTileRef(((salt & self.salt_mask()) << self.tile_bits) | (it & self.tile_mask()))
    }

    #[inline]
    fn decode_salt(&self, r: CompressedTileRef) -> u32 {
        (r.0 >> self.tile_bits) & self.salt_mask()
    }

    #[inline]
    fn decode_tile(&self, r: CompressedTileRef) -> u32 {
        r.0 & self.tile_mask()
    }

    #[inline]
    fn salt_mask(&self) -> u32 {
        ((1u64 << self.salt_bits) - 1) as u32
    }

    #[inline]
    fn tile_mask(&self) -> u32 {
        ((1u64 << self.tile_bits) - 1) as u32
    }
}

#[inline]
fn compute_tile_hash(x: i32, y: i32, mask: u32) -> usize {
    const H1: u32 = 0x8da6b343;
    const H2: u32 = 0xd8163841;
    let n = H1
        .wrapping_mul(x as u32)
        .wrapping_add(H2.wrapping_mul(y as u32));
    (n & mask) as usize
}

/// Compressed, obstacle-aware tile store that rebuilds NavMesh tiles.
pub struct TileCache {
    params: TileCacheParams,
    codec: CacheRefCodec,
    tiles: Vec<CompressedTile>,
    pos_lookup: Vec<Option<u32>>,
    lut_mask: u32,
    next_free_tile: Option<u32>,
    obstacles: Vec<Obstacle>,
    next_free_obstacle: Option<u32>,
    reqs: Vec<ObstacleRequest>,
    update: Vec<CompressedTileRef>,
    compressor: Box<dyn TileCompressor>,
    mesher: Box<dyn LayerMesher>,
    mesh_process: Option<Box<dyn MeshProcess>>,
    scratch: BuildScratch,
}

impl TileCache {
    /// Creates a tile cache with the given collaborators.
    pub fn new(
        params: TileCacheParams,
        compressor: Box<dyn TileCompressor>,
        mesher: Box<dyn LayerMesher>,
        mesh_process: Option<Box<dyn MeshProcess>>,
    ) -> Result<Self> {
        if !params.orig.iter().all(|v| v.is_finite()) {
            return Err(Status::InvalidParam);
        }
        if params.cs <= 0.0 || params.ch <= 0.0 {
            return Err(Status::InvalidParam);
        }
        if params.width <= 0 || params.height <= 0 {
            return Err(Status::InvalidParam);
        }
        if params.max_tiles <= 0 || params.max_obstacles <= 0 {
            return Err(Status::InvalidParam);
        }

        let codec = CacheRefCodec::new(params.max_tiles as u32)?;

        let lut_size = next_pow2(params.max_tiles as u32 / 4).max(1);
        let lut_mask = lut_size - 1;

        let max_tiles = params.max_tiles as usize;
        let mut tiles = Vec::with_capacity(max_tiles);
        tiles.resize_with(max_tiles, CompressedTile::default);
        let mut next_free_tile = None;
        for (i, tile) in tiles.iter_mut().enumerate().rev() {
            tile.salt = 1;
            tile.next = next_free_tile;
            next_free_tile = Some(i as u32);
        }

        let max_obstacles = params.max_obstacles as usize;
        let mut obstacles = Vec::with_capacity(max_obstacles);
        obstacles.resize_with(max_obstacles, Obstacle::default);
        let mut next_free_obstacle = None;
        for (i, ob) in obstacles.iter_mut().enumerate().rev() {
            ob.next = next_free_obstacle;
            next_free_obstacle = Some(i as u32);
        }

        Ok(Self {
            params,
            codec,
            tiles,
            pos_lookup: vec![None; lut_size as usize],
            lut_mask,
            next_free_tile,
            obstacles,
            next_free_obstacle,
            reqs: Vec::new(),
            update: Vec::new(),
            compressor,
            mesher,
            mesh_process,
            scratch: BuildScratch::new(),
        })
    }

    /// The parameters the cache was created with.
    pub fn get_params(&self) -> &TileCacheParams {
        &self.params
    }

    // ---- compressed tile store -------------------------------------------

    fn tile_index_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<usize> {
        let h = compute_tile_hash(tx, ty, self.lut_mask);
        let mut cur = self.pos_lookup[h];
        while let Some(i) = cur {
            let tile = &self.tiles[i as usize];
            if let Some(header) = &tile.header {
                if header.tx == tx && header.ty == ty && header.tlayer == tlayer {
                    return Some(i as usize);
                }
            }
            cur = tile.next;
        }
        None
    }

    /// The compressed tile at (tx, ty, tlayer), if loaded.
    pub fn get_tile_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<&CompressedTile> {
        self.tile_index_at(tx, ty, tlayer).map(|i| &self.tiles[i])
    }

    /// References of all compressed tiles in the (tx, ty) column.
    pub fn get_tiles_at(&self, tx: i32, ty: i32) -> Vec<CompressedTileRef> {
        let mut out = Vec::new();
        let h = compute_tile_hash(tx, ty, self.lut_mask);
        let mut cur = self.pos_lookup[h];
        while let Some(i) = cur {
            let tile = &self.tiles[i as usize];
            if let Some(header) = &tile.header {
                if header.tx == tx && header.ty == ty && out.len() < MAX_TILES_PER_COLUMN {
                    out.push(self.codec.encode(tile.salt, i));
                }
            }
            cur = tile.next;
        }
        out
    }

    /// Tile by reference; `None` when the salt is stale.
    pub fn get_tile_by_ref(&self, r: CompressedTileRef) -> Option<&CompressedTile> {
        self.tile_index_by_ref(r).map(|i| &self.tiles[i])
    }

    fn tile_index_by_ref(&self, r: CompressedTileRef) -> Option<usize> {
        if r.is_null() {
            return None;
        }
        let it = self.codec.decode_tile(r) as usize;
        if it >= self.tiles.len() {
            return None;
        }
        let tile = &self.tiles[it];
        if tile.salt != self.codec.decode_salt(r) || tile.header.is_none() {
            return None;
        }
        Some(it)
    }

    /// Adds a compressed layer payload to the cache.
    pub fn add_tile(
        &mut self,
        data: Vec<u8>,
        flags: CompressedTileFlags,
    ) -> Result<CompressedTileRef> {
        let header = LayerHeader::from_bytes(&data)?;

        if self.tile_index_at(header.tx, header.ty, header.tlayer).is_some() {
            return Err(Status::AlreadyOccupied);
        }

        let idx = match self.next_free_tile {
            Some(i) => {
                self.next_free_tile = self.tiles[i as usize].next;
                self.tiles[i as usize].next = None;
                i as usize
            }
            None => return Err(Status::OutOfMemory),
        };

        let h = compute_tile_hash(header.tx, header.ty, self.lut_mask);
        let tile = &mut self.tiles[idx];
        tile.next = self.pos_lookup[h];
        tile.data = data;
        tile.flags = flags;
        tile.header = Some(header);
        self.pos_lookup[h] = Some(idx as u32);

        Ok(self.codec.encode(self.tiles[idx].salt, idx as u32))
    }

    /// Removes a compressed tile. Returns the payload when the cache does
    /// not own it.
    pub fn remove_tile(&mut self, r: CompressedTileRef) -> Result<Option<Vec<u8>>> {
        if r.is_null() {
            return Err(Status::InvalidParam);
        }
        let it = self.codec.decode_tile(r) as usize;
        if it >= self.tiles.len() {
            return Err(Status::InvalidParam);
        }
        if self.tiles[it].salt != self.codec.decode_salt(r) || self.tiles[it].header.is_none() {
            return Err(Status::InvalidParam);
        }
        let header = self.tiles[it].header.clone().unwrap();

        let h = compute_tile_hash(header.tx, header.ty, self.lut_mask);
        let mut prev: Option<u32> = None;
        let mut cur = self.pos_lookup[h];
        while let Some(c) = cur {
            if c as usize == it {
                match prev {
                    None => self.pos_lookup[h] = self.tiles[c as usize].next,
                    Some(p) => self.tiles[p as usize].next = self.tiles[c as usize].next,
                }
                break;
            }
            prev = cur;
            cur = self.tiles[c as usize].next;
        }

        let tile = &mut self.tiles[it];
        let data = if tile.flags.contains(CompressedTileFlags::FREE_DATA) {
            tile.data = Vec::new();
            None
        } else {
            Some(std::mem::take(&mut tile.data))
        };
        tile.header = None;
        tile.flags = CompressedTileFlags::empty();

        tile.salt = (tile.salt + 1) & self.codec.salt_mask();
        if tile.salt == 0 {
            tile.salt = 1;
        }

        tile.next = self.next_free_tile;
        self.next_free_tile = Some(it as u32);

        Ok(data)
    }

    /// Compressed tiles whose tight bounds overlap an AABB.
    pub fn query_tiles(
        &self,
        bmin: &[f32; 3],
        bmax: &[f32; 3],
        max_results: usize,
    ) -> Vec<CompressedTileRef> {
        let mut out = Vec::new();

        let tw = self.params.width as f32 * self.params.cs;
        let th = self.params.height as f32 * self.params.cs;
        let tx0 = ((bmin[0] - self.params.orig[0]) / tw).floor() as i32;
        let tx1 = ((bmax[0] - self.params.orig[0]) / tw).floor() as i32;
        let ty0 = ((bmin[2] - self.params.orig[2]) / th).floor() as i32;
        let ty1 = ((bmax[2] - self.params.orig[2]) / th).floor() as i32;

        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                for r in self.get_tiles_at(tx, ty) {
                    let tile = &self.tiles[self.codec.decode_tile(r) as usize];
                    let (tbmin, tbmax) =
                        self.calc_tight_tile_bounds(tile.header.as_ref().unwrap());
                    if overlap_bounds(bmin, bmax, &tbmin, &tbmax) && out.len() < max_results {
                        out.push(r);
                    }
                }
            }
        }
        out
    }

    /// Tight world bounds of a layer, derived from its used grid extents.
    pub fn calc_tight_tile_bounds(&self, header: &LayerHeader) -> ([f32; 3], [f32; 3]) {
        let cs = self.params.cs;
        let bmin = [
            header.bmin[0] + header.minx as f32 * cs,
            header.bmin[1],
            header.bmin[2] + header.miny as f32 * cs,
        ];
        let bmax = [
            header.bmin[0] + (header.maxx + 1) as f32 * cs,
            header.bmax[1],
            header.bmin[2] + (header.maxy + 1) as f32 * cs,
        ];
        (bmin, bmax)
    }

    // ---- obstacles -------------------------------------------------------

    /// Conservative world bounds of an obstacle.
    pub fn get_obstacle_bounds(&self, ob: &Obstacle) -> ([f32; 3], [f32; 3]) {
        match &ob.geometry {
            ObstacleGeometry::Cylinder {
                pos,
                radius,
                height,
            } => (
                [pos[0] - radius, pos[1], pos[2] - radius],
                [pos[0] + radius, pos[1] + height, pos[2] + radius],
            ),
            ObstacleGeometry::Box { bmin, bmax } => (*bmin, *bmax),
            ObstacleGeometry::OrientedBox {
                center,
                half_extents,
                ..
            } => {
                let maxr = 1.41 * half_extents[0].max(half_extents[2]);
                (
                    [
                        center[0] - maxr,
                        center[1] - half_extents[1],
                        center[2] - maxr,
                    ],
                    [
                        center[0] + maxr,
                        center[1] + half_extents[1],
                        center[2] + maxr,
                    ],
                )
            }
        }
    }

    fn encode_obstacle_ref(salt: u16, idx: usize) -> ObstacleRef {
        ObstacleRef(((salt as u32) << 16) | idx as u32)
    }

    fn decode_obstacle_idx(r: ObstacleRef) -> usize {
        (r.0 & 0xffff) as usize
    }

    fn decode_obstacle_salt(r: ObstacleRef) -> u16 {
        ((r.0 >> 16) & 0xffff) as u16
    }

    /// Obstacle by reference; `None` when the salt is stale.
    pub fn get_obstacle_by_ref(&self, r: ObstacleRef) -> Option<&Obstacle> {
        if r.is_null() {
            return None;
        }
        let idx = Self::decode_obstacle_idx(r);
        let ob = self.obstacles.get(idx)?;
        if ob.salt != Self::decode_obstacle_salt(r) || ob.state == ObstacleState::Empty {
            return None;
        }
        Some(ob)
    }

    /// Reference of the obstacle in a slot, if occupied.
    pub fn get_obstacle_ref(&self, idx: usize) -> Option<ObstacleRef> {
        let ob = self.obstacles.get(idx)?;
        if ob.state == ObstacleState::Empty {
            return None;
        }
        Some(Self::encode_obstacle_ref(ob.salt, idx))
    }

    /// Number of live obstacles.
    pub fn get_obstacle_count(&self) -> usize {
        self.obstacles
            .iter()
            .filter(|ob| ob.state != ObstacleState::Empty)
            .count()
    }

    fn push_obstacle(&mut self, geometry: ObstacleGeometry) -> Result<ObstacleRef> {
        // Queue capacity is checked before any state changes so a full
        // queue leaves the cache untouched.
        if self.reqs.len() >= MAX_REQUESTS {
            return Err(Status::BufferTooSmall);
        }
        let idx = match self.next_free_obstacle {
            Some(i) => i as usize,
            None => return Err(Status::OutOfMemory),
        };
        let ob = &mut self.obstacles[idx];
        self.next_free_obstacle = ob.next;
        ob.next = None;
        ob.state = ObstacleState::Processing;
        ob.geometry = geometry;
        ob.touched.clear();
        ob.pending.clear();

        let r = Self::encode_obstacle_ref(ob.salt, idx);
        self.reqs.push(ObstacleRequest {
            action: RequestAction::Add,
            obstacle: r,
        });
        Ok(r)
    }

    /// Queues a cylindrical obstacle.
    pub fn add_obstacle(&mut self, pos: [f32; 3], radius: f32, height: f32) -> Result<ObstacleRef> {
        self.push_obstacle(ObstacleGeometry::Cylinder {
            pos,
            radius,
            height,
        })
    }

    /// Queues an axis-aligned box obstacle.
    pub fn add_box_obstacle(&mut self, bmin: [f32; 3], bmax: [f32; 3]) -> Result<ObstacleRef> {
        self.push_obstacle(ObstacleGeometry::Box { bmin, bmax })
    }

    /// Queues a y-rotated box obstacle.
    pub fn add_oriented_box_obstacle(
        &mut self,
        center: [f32; 3],
        half_extents: [f32; 3],
        y_radians: f32,
    ) -> Result<ObstacleRef> {
        let coshalf = (0.5 * y_radians).cos();
        let sinhalf = (-0.5 * y_radians).sin();
        self.push_obstacle(ObstacleGeometry::OrientedBox {
            center,
            half_extents,
            rot_aux: [coshalf * sinhalf, coshalf * coshalf - 0.5],
        })
    }

    /// Queues removal of an obstacle. A null reference is a no-op.
    pub fn remove_obstacle(&mut self, r: ObstacleRef) -> Result<()> {
        if r.is_null() {
            return Ok(());
        }
        if self.reqs.len() >= MAX_REQUESTS {
            return Err(Status::BufferTooSmall);
        }
        self.reqs.push(ObstacleRequest {
            action: RequestAction::Remove,
            obstacle: r,
        });
        Ok(())
    }

    // ---- incremental update ----------------------------------------------

    /// Drains pending obstacle requests and rebuilds at most one affected
    /// tile in `nav`. Returns true when both the request queue and the
    /// rebuild list are empty afterwards.
    pub fn update(&mut self, _dt: f32, nav: &mut NavMesh) -> Result<bool> {
        if self.update.is_empty() {
            // Process requests.
            let reqs = std::mem::take(&mut self.reqs);
            for req in reqs {
                let idx = Self::decode_obstacle_idx(req.obstacle);
                if idx >= self.obstacles.len() {
                    continue;
                }
                if self.obstacles[idx].salt != Self::decode_obstacle_salt(req.obstacle) {
                    continue;
                }

                match req.action {
                    RequestAction::Add => {
                        let (bmin, bmax) = self.get_obstacle_bounds(&self.obstacles[idx]);
                        let touched = self.query_tiles(&bmin, &bmax, MAX_TOUCHED_TILES);
                        self.obstacles[idx].touched = touched.clone();
                        self.obstacles[idx].pending.clear();
                        for t in touched {
                            if self.update.len() < MAX_UPDATE {
                                if !self.update.contains(&t) {
                                    self.update.push(t);
                                }
                                self.obstacles[idx].pending.push(t);
                            }
                        }
                    }
                    RequestAction::Remove => {
                        self.obstacles[idx].state = ObstacleState::Removing;
                        self.obstacles[idx].pending.clear();
                        let touched = self.obstacles[idx].touched.clone();
                        for t in touched {
                            if self.update.len() < MAX_UPDATE {
                                if !self.update.contains(&t) {
                                    self.update.push(t);
                                }
                                self.obstacles[idx].pending.push(t);
                            }
                        }
                    }
                }
            }
        }

        let mut build_result = Ok(());
        if !self.update.is_empty() {
            // Rebuild one tile, then retire it from every obstacle's
            // pending set.
            let r = self.update.remove(0);
            build_result = self.build_nav_mesh_tile(r, nav);

            for i in 0..self.obstacles.len() {
                let state = self.obstacles[i].state;
                if state != ObstacleState::Processing && state != ObstacleState::Removing {
                    continue;
                }
                if let Some(p) = self.obstacles[i].pending.iter().position(|&t| t == r) {
                    self.obstacles[i].pending.swap_remove(p);
                }
                if self.obstacles[i].pending.is_empty() {
                    match state {
                        ObstacleState::Processing => {
                            self.obstacles[i].state = ObstacleState::Processed;
                        }
                        ObstacleState::Removing => {
                            let ob = &mut self.obstacles[i];
                            ob.state = ObstacleState::Empty;
                            ob.touched.clear();
                            // Bump the salt; it must never be zero.
                            ob.salt = ob.salt.wrapping_add(1);
                            if ob.salt == 0 {
                                ob.salt = 1;
                            }
                            ob.next = self.next_free_obstacle;
                            self.next_free_obstacle = Some(i as u32);
                        }
                        _ => {}
                    }
                }
            }
        }

        let up_to_date = self.update.is_empty() && self.reqs.is_empty();
        build_result.map(|_| up_to_date)
    }

    /// Rebuilds every layer of a tile column into `nav`.
    pub fn build_nav_mesh_tiles_at(&mut self, tx: i32, ty: i32, nav: &mut NavMesh) -> Result<()> {
        for r in self.get_tiles_at(tx, ty) {
            self.build_nav_mesh_tile(r, nav)?;
        }
        Ok(())
    }

    /// Rebuilds one cache tile and swaps it into the live mesh.
    ///
    /// The existing live tile is removed only after the replacement data
    /// has been assembled, so a failing rebuild leaves the mesh intact.
    pub fn build_nav_mesh_tile(&mut self, r: CompressedTileRef, nav: &mut NavMesh) -> Result<()> {
        let idx = self.codec.decode_tile(r) as usize;
        if idx >= self.tiles.len() {
            return Err(Status::InvalidParam);
        }
        if self.tiles[idx].salt != self.codec.decode_salt(r) || self.tiles[idx].header.is_none() {
            return Err(Status::InvalidParam);
        }

        self.scratch.reset();

        let mut layer = decompress_tile_cache_layer(&*self.compressor, &self.tiles[idx].data)?;
        let orig = layer.header.bmin;
        let cs = self.params.cs;
        let ch = self.params.ch;

        // Stamp every live obstacle that touches this tile.
        for ob in &self.obstacles {
            if ob.state == ObstacleState::Empty || ob.state == ObstacleState::Removing {
                continue;
            }
            if !ob.touched.contains(&r) {
                continue;
            }
            match &ob.geometry {
                ObstacleGeometry::Cylinder {
                    pos,
                    radius,
                    height,
                } => mark_cylinder_area(&mut layer, &orig, cs, ch, pos, *radius, *height, 0),
                ObstacleGeometry::Box { bmin, bmax } => {
                    mark_box_area(&mut layer, &orig, cs, ch, bmin, bmax, 0)
                }
                ObstacleGeometry::OrientedBox {
                    center,
                    half_extents,
                    rot_aux,
                } => mark_oriented_box_area(
                    &mut layer,
                    &orig,
                    cs,
                    ch,
                    center,
                    half_extents,
                    rot_aux,
                    0,
                ),
            }
        }

        let walkable_climb_vx = (self.params.walkable_climb / ch) as i32;
        let mut mesh = self
            .mesher
            .build(&layer, walkable_climb_vx, &mut self.scratch)?;

        let (tx, ty, tlayer) = (layer.header.tx, layer.header.ty, layer.header.tlayer);

        // An empty mesh just vacates the location.
        if mesh.npolys == 0 {
            if let Some(old) = nav.get_tile_ref_at(tx, ty, tlayer) {
                let _ = nav.remove_tile(old);
            }
            return Ok(());
        }

        if let Some(proc) = self.mesh_process.as_mut() {
            proc.process(&mut mesh.areas, &mut mesh.flags);
        }

        // Grid units to world space.
        let mut verts = Vec::with_capacity(mesh.nverts * 3);
        for i in 0..mesh.nverts {
            verts.push(orig[0] + mesh.verts[i * 3] as f32 * cs);
            verts.push(orig[1] + mesh.verts[i * 3 + 1] as f32 * ch);
            verts.push(orig[2] + mesh.verts[i * 3 + 2] as f32 * cs);
        }

        let create = NavMeshCreateParams {
            verts,
            vert_count: mesh.nverts,
            polys: mesh.polys,
            poly_flags: mesh.flags,
            poly_areas: mesh.areas,
            poly_count: mesh.npolys,
            nvp: mesh.nvp,
            tile_x: tx,
            tile_y: ty,
            tile_layer: tlayer,
            bmin: layer.header.bmin,
            bmax: layer.header.bmax,
            walkable_height: self.params.walkable_height,
            walkable_radius: self.params.walkable_radius,
            walkable_climb: self.params.walkable_climb,
            cs,
            ch,
            // Layers are small; queries do fine with the linear path.
            build_bv_tree: false,
            ..Default::default()
        };
        let data = create_nav_mesh_data(&create)?;

        log::debug!("rebuilding nav mesh tile ({tx}, {ty}, {tlayer})");
        if let Some(old) = nav.get_tile_ref_at(tx, ty, tlayer) {
            let _ = nav.remove_tile(old);
        }
        nav.add_tile(data, TileFlags::FREE_DATA, TileRef::NULL).map(|_| ())
    }
}
