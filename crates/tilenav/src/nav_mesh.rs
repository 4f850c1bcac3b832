//! Navigation mesh: tile store, cross-tile stitching and spatial queries.
//!
//! The mesh owns a fixed array of tile slots allocated at init. Slots are
//! threaded onto a free list through their `next` index; live slots hang
//! off a position hash keyed on the tile's (x, y) column instead. Tiles
//! enter through [`NavMesh::add_tile`], which patches the payload into
//! runtime form and stitches it to every loaded neighbour, and leave
//! through [`NavMesh::remove_tile`], which unlinks them everywhere and
//! bumps the slot's salt so stale references die.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use tilenav_common::{
    clamp, closest_height_point_triangle, dist_pt_seg_sqr_2d, next_pow2, opposite_tile,
    overlap_bounds, overlap_quant_bounds, point_in_polygon_2d, sqr, vadd, vlen_sqr, vlerp, vsub,
    Vec3,
};

use super::ref_codec::{PolyRef, RefCodec, TileRef};
use super::tile_data::{
    BvNode, Link, MeshHeader, OffMeshConnection, Poly, PolyDetail, PolyFlags, PolyType, TileData,
    TileFlags, NAVMESH_STATE_MAGIC, NAVMESH_STATE_VERSION,
};
use super::{Result, Status, DETAIL_EDGE_BOUNDARY, EXT_LINK, NULL_LINK, VERTS_PER_POLY};

/// Most tiles considered per hash-bucket lookup.
const MAX_NEIS: usize = 32;

/// Most neighbour polygons matched per portal edge.
const MAX_CONNECTING_POLYS: usize = 4;

/// Candidate buffer size for nearest-polygon searches.
const MAX_NEAREST_CANDIDATES: usize = 128;

/// Configuration for a navigation mesh.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshParams {
    /// World-space origin of the tile grid.
    pub orig: [f32; 3],
    /// Width of each tile along the x-axis.
    pub tile_width: f32,
    /// Height of each tile along the z-axis.
    pub tile_height: f32,
    /// Number of tile slots to allocate.
    pub max_tiles: i32,
    /// Largest polygon count any tile may carry.
    pub max_polys: i32,
}

/// A tile slot in the navigation mesh.
///
/// A slot with a `None` header is free (or just released); the remaining
/// fields are only meaningful while the slot is occupied.
#[derive(Debug, Default)]
pub struct MeshTile {
    /// Generation counter; never zero for a slot that has ever been used.
    pub salt: u32,
    /// Header of the resident payload, `None` while the slot is free.
    pub header: Option<MeshHeader>,
    /// Vertices as flat float triples.
    pub verts: Vec<f32>,
    pub polys: Vec<Poly>,
    /// Link pool shared by all polygons of the tile.
    pub links: Vec<Link>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<f32>,
    pub detail_tris: Vec<u8>,
    /// BVH nodes; empty when the tile has no tree.
    pub bv_tree: Vec<BvNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
    /// Tile flags from `add_tile`.
    pub flags: TileFlags,
    /// The raw payload blob the tile was created from.
    pub(crate) data: Vec<u8>,
    /// Head of the link free chain.
    pub(crate) links_free_list: u32,
    /// Hash-bucket chain while occupied, free-list chain while free.
    pub(crate) next: Option<u32>,
}

impl MeshTile {
    fn alloc_link(&mut self) -> u32 {
        if self.links_free_list == NULL_LINK {
            return NULL_LINK;
        }
        let link = self.links_free_list;
        self.links_free_list = self.links[link as usize].next;
        link
    }

    fn free_link(&mut self, link: u32) {
        self.links[link as usize].next = self.links_free_list;
        self.links_free_list = link;
    }

    #[inline]
    fn vert(&self, i: u16) -> [f32; 3] {
        let i = i as usize * 3;
        [self.verts[i], self.verts[i + 1], self.verts[i + 2]]
    }
}

/// Tiled navigation mesh.
pub struct NavMesh {
    params: NavMeshParams,
    orig: [f32; 3],
    tile_width: f32,
    tile_height: f32,
    codec: RefCodec,
    tiles: Vec<MeshTile>,
    /// Bucket heads of the (x, y) position hash.
    pos_lookup: Vec<Option<u32>>,
    lut_mask: u32,
    /// Head of the tile free list.
    next_free: Option<u32>,
}

/// Multiplicative hash over a tile column location.
#[inline]
fn compute_tile_hash(x: i32, y: i32, mask: u32) -> usize {
    const H1: u32 = 0x8da6b343;
    const H2: u32 = 0xd8163841;
    let n = H1
        .wrapping_mul(x as u32)
        .wrapping_add(H2.wrapping_mul(y as u32));
    (n & mask) as usize
}

impl NavMesh {
    /// Creates a navigation mesh with the given tile layout.
    pub fn new(params: &NavMeshParams) -> Result<Self> {
        if !params.orig.iter().all(|v| v.is_finite()) {
            return Err(Status::InvalidParam);
        }
        if params.tile_width <= 0.0 || params.tile_height <= 0.0 {
            return Err(Status::InvalidParam);
        }
        if params.max_tiles <= 0 || params.max_polys <= 0 {
            return Err(Status::InvalidParam);
        }

        let codec = RefCodec::new(params.max_tiles as u32, params.max_polys as u32)?;

        let lut_size = next_pow2(params.max_tiles as u32 / 4).max(1);
        let lut_mask = lut_size - 1;

        // Lace the free list back to front so slot 0 is allocated first.
        let max_tiles = params.max_tiles as usize;
        let mut tiles = Vec::with_capacity(max_tiles);
        tiles.resize_with(max_tiles, MeshTile::default);
        let mut next_free = None;
        for (i, tile) in tiles.iter_mut().enumerate().rev() {
            tile.salt = 1;
            tile.next = next_free;
            next_free = Some(i as u32);
        }

        Ok(Self {
            orig: params.orig,
            tile_width: params.tile_width,
            tile_height: params.tile_height,
            params: params.clone(),
            codec,
            tiles,
            pos_lookup: vec![None; lut_size as usize],
            lut_mask,
            next_free,
        })
    }

    /// Creates a mesh sized for exactly one tile and adds the payload.
    pub fn single_tile(data: Vec<u8>, flags: TileFlags) -> Result<(Self, TileRef)> {
        let parsed = TileData::from_bytes(&data)?;
        let params = NavMeshParams {
            orig: parsed.header.bmin,
            tile_width: parsed.header.bmax[0] - parsed.header.bmin[0],
            tile_height: parsed.header.bmax[2] - parsed.header.bmin[2],
            max_tiles: 1,
            max_polys: parsed.header.poly_count.max(1),
        };
        let mut mesh = NavMesh::new(&params)?;
        let tile_ref = mesh.add_tile(data, flags, TileRef::NULL)?;
        Ok((mesh, tile_ref))
    }

    /// The parameters the mesh was created with.
    pub fn get_params(&self) -> &NavMeshParams {
        &self.params
    }

    /// Number of tile slots.
    pub fn get_max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Tile slot by index.
    pub fn get_tile(&self, i: usize) -> Option<&MeshTile> {
        self.tiles.get(i)
    }

    /// Tile column containing a world position.
    pub fn calc_tile_loc(&self, pos: Vec3) -> (i32, i32) {
        let tx = ((pos.x - self.orig[0]) / self.tile_width).floor() as i32;
        let ty = ((pos.z - self.orig[2]) / self.tile_height).floor() as i32;
        (tx, ty)
    }

    /// Unpacks a polygon reference into (salt, tile index, poly index).
    pub fn decode_poly_ref(&self, r: PolyRef) -> (u32, u32, u32) {
        self.codec.decode(r)
    }

    // ---- tile lookup -----------------------------------------------------

    fn tile_indices_at(&self, x: i32, y: i32) -> Vec<usize> {
        let mut out = Vec::new();
        let h = compute_tile_hash(x, y, self.lut_mask);
        let mut cur = self.pos_lookup[h];
        while let Some(i) = cur {
            let tile = &self.tiles[i as usize];
            if let Some(header) = &tile.header {
                if header.x == x && header.y == y && out.len() < MAX_NEIS {
                    out.push(i as usize);
                }
            }
            cur = tile.next;
        }
        out
    }

    fn tile_index_at(&self, x: i32, y: i32, layer: i32) -> Option<usize> {
        let h = compute_tile_hash(x, y, self.lut_mask);
        let mut cur = self.pos_lookup[h];
        while let Some(i) = cur {
            let tile = &self.tiles[i as usize];
            if let Some(header) = &tile.header {
                if header.x == x && header.y == y && header.layer == layer {
                    return Some(i as usize);
                }
            }
            cur = tile.next;
        }
        None
    }

    fn neighbour_tile_indices(&self, x: i32, y: i32, side: i32) -> Vec<usize> {
        let (mut nx, mut ny) = (x, y);
        match side {
            0 => nx += 1,
            1 => {
                nx += 1;
                ny += 1;
            }
            2 => ny += 1,
            3 => {
                nx -= 1;
                ny += 1;
            }
            4 => nx -= 1,
            5 => {
                nx -= 1;
                ny -= 1;
            }
            6 => ny -= 1,
            7 => {
                nx += 1;
                ny -= 1;
            }
            _ => {}
        }
        self.tile_indices_at(nx, ny)
    }

    /// The tile at grid location (x, y, layer), if loaded.
    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        self.tile_index_at(x, y, layer).map(|i| &self.tiles[i])
    }

    /// All loaded tiles in the (x, y) column.
    pub fn get_tiles_at(&self, x: i32, y: i32) -> Vec<&MeshTile> {
        self.tile_indices_at(x, y)
            .into_iter()
            .map(|i| &self.tiles[i])
            .collect()
    }

    /// All loaded tiles one step toward `side` (compass 0..7) from the
    /// (x, y) column.
    pub fn get_neighbour_tiles_at(&self, x: i32, y: i32, side: i32) -> Vec<&MeshTile> {
        self.neighbour_tile_indices(x, y, side)
            .into_iter()
            .map(|i| &self.tiles[i])
            .collect()
    }

    /// Reference of the tile at (x, y, layer), if loaded.
    pub fn get_tile_ref_at(&self, x: i32, y: i32, layer: i32) -> Option<TileRef> {
        self.tile_index_at(x, y, layer)
            .map(|i| self.codec.encode_tile(self.tiles[i].salt, i as u32))
    }

    /// Tile by reference; `None` when the salt is stale.
    pub fn get_tile_by_ref(&self, r: TileRef) -> Option<&MeshTile> {
        self.tile_index_by_ref(r).map(|i| &self.tiles[i])
    }

    fn tile_index_by_ref(&self, r: TileRef) -> Option<usize> {
        if r.is_null() {
            return None;
        }
        let it = self.codec.decode_tile(r.base()) as usize;
        let salt = self.codec.decode_salt(r.base());
        if it >= self.tiles.len() {
            return None;
        }
        let tile = &self.tiles[it];
        if tile.salt != salt || tile.header.is_none() {
            return None;
        }
        Some(it)
    }

    #[inline]
    fn poly_ref_base(&self, idx: usize) -> PolyRef {
        self.codec.encode(self.tiles[idx].salt, idx as u32, 0)
    }

    // ---- reference resolution --------------------------------------------

    /// Resolves a polygon reference after full validation: range, salt,
    /// live header and polygon index.
    pub fn get_tile_and_poly_by_ref(&self, r: PolyRef) -> Result<(&MeshTile, &Poly)> {
        if r.is_null() {
            return Err(Status::InvalidParam);
        }
        let (salt, it, ip) = self.codec.decode(r);
        let tile = self.tiles.get(it as usize).ok_or(Status::InvalidParam)?;
        let header = tile.header.as_ref().ok_or(Status::InvalidParam)?;
        if tile.salt != salt || ip >= header.poly_count as u32 {
            return Err(Status::InvalidParam);
        }
        Ok((tile, &tile.polys[ip as usize]))
    }

    /// Resolves a polygon reference without validation.
    ///
    /// Only for hot paths holding references already known valid; a stale
    /// reference will panic or return unrelated data.
    pub fn get_tile_and_poly_by_ref_unchecked(&self, r: PolyRef) -> (&MeshTile, &Poly) {
        let (_, it, ip) = self.codec.decode(r);
        let tile = &self.tiles[it as usize];
        (tile, &tile.polys[ip as usize])
    }

    /// Whether a polygon reference is currently valid.
    pub fn is_valid_poly_ref(&self, r: PolyRef) -> bool {
        self.get_tile_and_poly_by_ref(r).is_ok()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Adds a tile payload to the mesh and stitches it to its neighbours.
    ///
    /// A non-null `last_ref` re-instates a previously removed tile in its
    /// old slot with its old salt, so references taken before the removal
    /// resolve again.
    pub fn add_tile(&mut self, data: Vec<u8>, flags: TileFlags, last_ref: TileRef) -> Result<TileRef> {
        let parsed = TileData::from_bytes(&data)?;
        let header = parsed.header.clone();

        // The polygon field must be able to index every polygon.
        if next_pow2(header.poly_count as u32) > self.codec.max_polys() {
            return Err(Status::InvalidParam);
        }
        if self.tile_index_at(header.x, header.y, header.layer).is_some() {
            return Err(Status::AlreadyOccupied);
        }

        let idx = if last_ref.is_null() {
            match self.next_free {
                Some(i) => {
                    self.next_free = self.tiles[i as usize].next;
                    self.tiles[i as usize].next = None;
                    i as usize
                }
                None => return Err(Status::OutOfMemory),
            }
        } else {
            // Relocate to the slot the old reference names; it must still
            // be on the free list.
            let target = self.codec.decode_tile(last_ref.base()) as usize;
            if target >= self.tiles.len() {
                return Err(Status::OutOfMemory);
            }
            let mut prev: Option<u32> = None;
            let mut cur = self.next_free;
            while let Some(c) = cur {
                if c as usize == target {
                    break;
                }
                prev = cur;
                cur = self.tiles[c as usize].next;
            }
            if cur.map(|c| c as usize) != Some(target) {
                return Err(Status::OutOfMemory);
            }
            match prev {
                None => self.next_free = self.tiles[target].next,
                Some(p) => self.tiles[p as usize].next = self.tiles[target].next,
            }
            self.tiles[target].next = None;
            // Restore the salt the reference was minted with.
            self.tiles[target].salt = self.codec.decode_salt(last_ref.base());
            target
        };

        let h = compute_tile_hash(header.x, header.y, self.lut_mask);
        {
            let tile = &mut self.tiles[idx];
            tile.next = self.pos_lookup[h];
            tile.verts = parsed.verts;
            tile.polys = parsed.polys;
            tile.links = parsed.links;
            tile.detail_meshes = parsed.detail_meshes;
            tile.detail_verts = parsed.detail_verts;
            tile.detail_tris = parsed.detail_tris;
            tile.bv_tree = parsed.bv_tree;
            tile.off_mesh_cons = parsed.off_mesh_cons;
            tile.flags = flags;
            tile.data = data;

            // Lace the link pool into a free chain.
            let nlinks = tile.links.len();
            if nlinks == 0 {
                tile.links_free_list = NULL_LINK;
            } else {
                for i in 0..nlinks - 1 {
                    tile.links[i].next = (i + 1) as u32;
                }
                tile.links[nlinks - 1].next = NULL_LINK;
                tile.links_free_list = 0;
            }
            tile.header = Some(header.clone());
        }
        self.pos_lookup[h] = Some(idx as u32);

        self.connect_int_links(idx);

        // Base off-mesh connections to their start polygons and connect
        // connections inside the tile.
        self.base_off_mesh_links(idx);
        self.connect_ext_off_mesh_links(idx, idx, -1);

        // Connect with layers in the current column.
        for j in self.tile_indices_at(header.x, header.y) {
            if j == idx {
                continue;
            }
            self.connect_ext_links(idx, j, -1);
            self.connect_ext_links(j, idx, -1);
            self.connect_ext_off_mesh_links(idx, j, -1);
            self.connect_ext_off_mesh_links(j, idx, -1);
        }

        // Connect with neighbour tiles.
        for side in 0..8 {
            for j in self.neighbour_tile_indices(header.x, header.y, side) {
                self.connect_ext_links(idx, j, side);
                self.connect_ext_links(j, idx, opposite_tile(side));
                self.connect_ext_off_mesh_links(idx, j, side);
                self.connect_ext_off_mesh_links(j, idx, opposite_tile(side));
            }
        }

        let tile_ref = self.codec.encode_tile(self.tiles[idx].salt, idx as u32);
        log::debug!(
            "added tile ({}, {}, {}) to slot {}",
            header.x,
            header.y,
            header.layer,
            idx
        );
        Ok(tile_ref)
    }

    /// Removes a tile, unlinking it from every neighbour.
    ///
    /// Returns the payload when the mesh does not own it
    /// ([`TileFlags::FREE_DATA`] clear), `None` otherwise.
    pub fn remove_tile(&mut self, r: TileRef) -> Result<Option<Vec<u8>>> {
        if r.is_null() {
            return Err(Status::InvalidParam);
        }
        let it = self.codec.decode_tile(r.base()) as usize;
        let salt = self.codec.decode_salt(r.base());
        if it >= self.tiles.len() {
            return Err(Status::InvalidParam);
        }
        if self.tiles[it].salt != salt || self.tiles[it].header.is_none() {
            return Err(Status::InvalidParam);
        }
        let header = self.tiles[it].header.clone().unwrap();

        // Remove from the hash bucket.
        let h = compute_tile_hash(header.x, header.y, self.lut_mask);
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

        // Disconnect from other layers in the current column.
        for j in self.tile_indices_at(header.x, header.y) {
            if j == it {
                continue;
            }
            self.unconnect_links(j, it as u32);
        }

        // Disconnect from neighbour tiles.
        for side in 0..8 {
            for j in self.neighbour_tile_indices(header.x, header.y, side) {
                self.unconnect_links(j, it as u32);
            }
        }

        let tile = &mut self.tiles[it];
        let data = if tile.flags.contains(TileFlags::FREE_DATA) {
            tile.data = Vec::new();
            None
        } else {
            Some(std::mem::take(&mut tile.data))
        };

        tile.header = None;
        tile.flags = TileFlags::empty();
        tile.verts = Vec::new();
        tile.polys = Vec::new();
        tile.links = Vec::new();
        tile.detail_meshes = Vec::new();
        tile.detail_verts = Vec::new();
        tile.detail_tris = Vec::new();
        tile.bv_tree = Vec::new();
        tile.off_mesh_cons = Vec::new();
        tile.links_free_list = NULL_LINK;

        // Bump the salt; it must never be zero.
        tile.salt = (tile.salt + 1) & self.codec.salt_mask();
        if tile.salt == 0 {
            tile.salt = 1;
        }

        tile.next = self.next_free;
        self.next_free = Some(it as u32);

        log::debug!(
            "removed tile ({}, {}, {}) from slot {}",
            header.x,
            header.y,
            header.layer,
            it
        );
        Ok(data)
    }

    // ---- stitching -------------------------------------------------------

    fn connect_int_links(&mut self, idx: usize) {
        let base = self.poly_ref_base(idx);
        let tile = &mut self.tiles[idx];
        if tile.header.is_none() {
            return;
        }
        for i in 0..tile.polys.len() {
            tile.polys[i].first_link = NULL_LINK;
            if tile.polys[i].poly_type == PolyType::OffMeshConnection {
                continue;
            }
            // Build edge links backwards so the chain reads in ascending
            // edge order.
            for j in (0..tile.polys[i].vert_count as usize).rev() {
                let nei = tile.polys[i].neis[j];
                if nei == 0 || nei & EXT_LINK != 0 {
                    continue;
                }
                let l = tile.alloc_link();
                if l != NULL_LINK {
                    let first = tile.polys[i].first_link;
                    tile.links[l as usize] = Link {
                        target: PolyRef(base.0 | (nei - 1) as u32),
                        edge: j as u8,
                        side: 0xff,
                        bmin: 0,
                        bmax: 0,
                        next: first,
                    };
                    tile.polys[i].first_link = l;
                }
            }
        }
    }

    fn connect_ext_links(&mut self, idx: usize, target_idx: usize, side: i32) {
        struct PendingLink {
            poly: usize,
            edge: u8,
            dir: u8,
            target: PolyRef,
            bmin: u8,
            bmax: u8,
        }

        let mut pending: Vec<PendingLink> = Vec::new();
        {
            let tile = &self.tiles[idx];
            let target = &self.tiles[target_idx];
            if tile.header.is_none() || target.header.is_none() {
                return;
            }
            for (i, poly) in tile.polys.iter().enumerate() {
                let nv = poly.vert_count as usize;
                for j in 0..nv {
                    if poly.neis[j] & EXT_LINK == 0 {
                        continue;
                    }
                    let dir = (poly.neis[j] & 0xff) as i32;
                    if side != -1 && dir != side {
                        continue;
                    }
                    let va = tile.vert(poly.verts[j]);
                    let vb = tile.vert(poly.verts[(j + 1) % nv]);
                    let neighbours = find_connecting_polys(
                        &self.codec,
                        target,
                        target_idx,
                        &va,
                        &vb,
                        opposite_tile(dir),
                    );
                    for (nref, amin, amax) in neighbours {
                        // Compress the portal limits onto the source
                        // edge's 0..1 parametric range.
                        let (mut tmin, mut tmax) = if dir == 0 || dir == 4 {
                            (
                                (amin - va[2]) / (vb[2] - va[2]),
                                (amax - va[2]) / (vb[2] - va[2]),
                            )
                        } else if dir == 2 || dir == 6 {
                            (
                                (amin - va[0]) / (vb[0] - va[0]),
                                (amax - va[0]) / (vb[0] - va[0]),
                            )
                        } else {
                            (0.0, 0.0)
                        };
                        if tmin > tmax {
                            std::mem::swap(&mut tmin, &mut tmax);
                        }
                        pending.push(PendingLink {
                            poly: i,
                            edge: j as u8,
                            dir: dir as u8,
                            target: nref,
                            bmin: (clamp(tmin, 0.0, 1.0) * 255.0).round() as u8,
                            bmax: (clamp(tmax, 0.0, 1.0) * 255.0).round() as u8,
                        });
                    }
                }
            }
        }

        let tile = &mut self.tiles[idx];
        for p in pending {
            let l = tile.alloc_link();
            if l != NULL_LINK {
                let first = tile.polys[p.poly].first_link;
                tile.links[l as usize] = Link {
                    target: p.target,
                    edge: p.edge,
                    side: p.dir,
                    bmin: p.bmin,
                    bmax: p.bmax,
                    next: first,
                };
                tile.polys[p.poly].first_link = l;
            }
        }
    }

    fn base_off_mesh_links(&mut self, idx: usize) {
        let base = self.poly_ref_base(idx);
        let codec = self.codec;

        let mut binds: Vec<(usize, PolyRef, [f32; 3])> = Vec::new();
        {
            let tile = &self.tiles[idx];
            let Some(header) = tile.header.as_ref() else {
                return;
            };
            for (i, con) in tile.off_mesh_cons.iter().enumerate() {
                let half_extents = [con.radius, header.walkable_climb, con.radius];
                let p = con.start_pos();
                let Some((nref, nearest)) =
                    find_nearest_poly_in_tile(&codec, tile, idx, &p, &half_extents)
                else {
                    continue;
                };
                // The nearest-poly search can be optimistic; reject binds
                // whose horizontal snap exceeds the connection radius.
                if sqr(nearest[0] - p[0]) + sqr(nearest[2] - p[2]) > sqr(con.radius) {
                    continue;
                }
                binds.push((i, nref, nearest));
            }
        }

        let tile = &mut self.tiles[idx];
        for (i, nref, nearest) in binds {
            let con_poly = tile.off_mesh_cons[i].poly as usize;

            // Pin the start vertex to the snapped location.
            let v = tile.polys[con_poly].verts[0] as usize;
            tile.verts[v * 3..v * 3 + 3].copy_from_slice(&nearest);

            // Off-mesh connection to its start polygon.
            let l = tile.alloc_link();
            if l != NULL_LINK {
                let first = tile.polys[con_poly].first_link;
                tile.links[l as usize] = Link {
                    target: nref,
                    edge: 0,
                    side: 0xff,
                    bmin: 0,
                    bmax: 0,
                    next: first,
                };
                tile.polys[con_poly].first_link = l;
            }

            // The start polygon always links back to the connection.
            let land = codec.decode_poly(nref) as usize;
            let l = tile.alloc_link();
            if l != NULL_LINK {
                let first = tile.polys[land].first_link;
                tile.links[l as usize] = Link {
                    target: PolyRef(base.0 | con_poly as u32),
                    edge: 0xff,
                    side: 0xff,
                    bmin: 0,
                    bmax: 0,
                    next: first,
                };
                tile.polys[land].first_link = l;
            }
        }
    }

    /// Connects off-mesh connections in `target` whose far endpoint lands
    /// inside `tile`. `idx == target_idx` handles the intra-tile case.
    fn connect_ext_off_mesh_links(&mut self, idx: usize, target_idx: usize, side: i32) {
        let codec = self.codec;
        let opposite_side = if side == -1 {
            0xffu8
        } else {
            opposite_tile(side) as u8
        };

        let mut binds: Vec<(usize, PolyRef, [f32; 3])> = Vec::new();
        {
            let tile = &self.tiles[idx];
            let target = &self.tiles[target_idx];
            if tile.header.is_none() {
                return;
            }
            let Some(target_header) = target.header.as_ref() else {
                return;
            };
            for (i, con) in target.off_mesh_cons.iter().enumerate() {
                if con.side != opposite_side {
                    continue;
                }
                // Skip connections whose start side could not be bound.
                if target.polys[con.poly as usize].first_link == NULL_LINK {
                    continue;
                }
                let half_extents = [con.radius, target_header.walkable_climb, con.radius];
                let p = con.end_pos();
                let Some((nref, nearest)) =
                    find_nearest_poly_in_tile(&codec, tile, idx, &p, &half_extents)
                else {
                    continue;
                };
                if sqr(nearest[0] - p[0]) + sqr(nearest[2] - p[2]) > sqr(con.radius) {
                    continue;
                }
                binds.push((i, nref, nearest));
            }
        }

        for (i, nref, nearest) in binds {
            let (con_poly, bidir) = {
                let con = &self.tiles[target_idx].off_mesh_cons[i];
                (con.poly as usize, con.is_bidirectional())
            };

            {
                let target = &mut self.tiles[target_idx];
                // Pin the landing vertex to the snapped location.
                let v = target.polys[con_poly].verts[1] as usize;
                target.verts[v * 3..v * 3 + 3].copy_from_slice(&nearest);

                // Off-mesh connection to the landing polygon.
                let l = target.alloc_link();
                if l != NULL_LINK {
                    let first = target.polys[con_poly].first_link;
                    target.links[l as usize] = Link {
                        target: nref,
                        edge: 1,
                        side: opposite_side,
                        bmin: 0,
                        bmax: 0,
                        next: first,
                    };
                    target.polys[con_poly].first_link = l;
                }
            }

            if bidir {
                let target_base = self.poly_ref_base(target_idx);
                let land = codec.decode_poly(nref) as usize;
                let tile = &mut self.tiles[idx];
                let l = tile.alloc_link();
                if l != NULL_LINK {
                    let first = tile.polys[land].first_link;
                    tile.links[l as usize] = Link {
                        target: PolyRef(target_base.0 | con_poly as u32),
                        edge: 0xff,
                        side: if side == -1 { 0xff } else { side as u8 },
                        bmin: 0,
                        bmax: 0,
                        next: first,
                    };
                    tile.polys[land].first_link = l;
                }
            }
        }
    }

    /// Removes every link in `idx` that targets tile slot `target_idx`.
    fn unconnect_links(&mut self, idx: usize, target_idx: u32) {
        let codec = self.codec;
        let tile = &mut self.tiles[idx];
        if tile.header.is_none() {
            return;
        }
        for i in 0..tile.polys.len() {
            let mut j = tile.polys[i].first_link;
            let mut pj = NULL_LINK;
            while j != NULL_LINK {
                if codec.decode_tile(tile.links[j as usize].target) == target_idx {
                    let nj = tile.links[j as usize].next;
                    if pj == NULL_LINK {
                        tile.polys[i].first_link = nj;
                    } else {
                        tile.links[pj as usize].next = nj;
                    }
                    tile.free_link(j);
                    j = nj;
                } else {
                    pj = j;
                    j = tile.links[j as usize].next;
                }
            }
        }
    }

    // ---- queries ---------------------------------------------------------

    /// Polygons of one tile overlapping an AABB, truncated to `max_polys`.
    pub fn query_polygons_in_tile(
        &self,
        tile_ref: TileRef,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
        max_polys: usize,
    ) -> Vec<PolyRef> {
        match self.tile_index_by_ref(tile_ref) {
            Some(i) => query_polygons_in_tile(&self.codec, &self.tiles[i], i, qmin, qmax, max_polys),
            None => Vec::new(),
        }
    }

    /// Nearest polygon to `center` within one tile, searched inside
    /// `center ± half_extents`. Returns the polygon and the closest point
    /// on it.
    pub fn find_nearest_poly_in_tile(
        &self,
        tile_ref: TileRef,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Option<(PolyRef, [f32; 3])> {
        let i = self.tile_index_by_ref(tile_ref)?;
        find_nearest_poly_in_tile(&self.codec, &self.tiles[i], i, center, half_extents)
    }

    /// Closest point on a polygon; the boolean is true when `pos` lies
    /// over the polygon footprint.
    pub fn closest_point_on_poly(&self, r: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        let (_, it, ip) = self.codec.decode(r);
        let tile = self.tiles.get(it as usize).ok_or(Status::InvalidParam)?;
        let header = tile.header.as_ref().ok_or(Status::InvalidParam)?;
        if ip >= header.poly_count as u32 {
            return Err(Status::InvalidParam);
        }
        Ok(closest_point_on_poly_in_tile(tile, ip as usize, pos))
    }

    // ---- polygon attribute accessors ------------------------------------

    /// Sets the flags of a polygon.
    pub fn set_poly_flags(&mut self, r: PolyRef, flags: PolyFlags) -> Result<()> {
        let ip = self.checked_poly_index(r)?;
        let it = self.codec.decode_tile(r) as usize;
        self.tiles[it].polys[ip].flags = flags;
        Ok(())
    }

    /// Gets the flags of a polygon.
    pub fn get_poly_flags(&self, r: PolyRef) -> Result<PolyFlags> {
        let (_, poly) = self.get_tile_and_poly_by_ref(r)?;
        Ok(poly.flags)
    }

    /// Sets the area id of a polygon.
    pub fn set_poly_area(&mut self, r: PolyRef, area: u8) -> Result<()> {
        let ip = self.checked_poly_index(r)?;
        let it = self.codec.decode_tile(r) as usize;
        self.tiles[it].polys[ip].area = area;
        Ok(())
    }

    /// Gets the area id of a polygon.
    pub fn get_poly_area(&self, r: PolyRef) -> Result<u8> {
        let (_, poly) = self.get_tile_and_poly_by_ref(r)?;
        Ok(poly.area)
    }

    fn checked_poly_index(&self, r: PolyRef) -> Result<usize> {
        self.get_tile_and_poly_by_ref(r)?;
        Ok(self.codec.decode_poly(r) as usize)
    }

    // ---- off-mesh connections -------------------------------------------

    /// The descriptor behind an off-mesh polygon reference.
    pub fn get_off_mesh_connection_by_ref(&self, r: PolyRef) -> Option<&OffMeshConnection> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(r).ok()?;
        if poly.poly_type != PolyType::OffMeshConnection {
            return None;
        }
        let header = tile.header.as_ref()?;
        let ip = self.codec.decode_poly(r);
        let i = ip.checked_sub(header.off_mesh_base as u32)? as usize;
        tile.off_mesh_cons.get(i)
    }

    /// Endpoints of an off-mesh polygon ordered for travel away from
    /// `prev_ref` (the polygon the agent is entering from).
    pub fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> Result<([f32; 3], [f32; 3])> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if poly.poly_type != PolyType::OffMeshConnection {
            return Err(Status::Failure);
        }

        // Pick vertex order from the link that leads back to prev_ref.
        let (mut idx0, mut idx1) = (0usize, 1usize);
        let mut l = poly.first_link;
        while l != NULL_LINK {
            let link = &tile.links[l as usize];
            if link.edge == 0 {
                if link.target != prev_ref {
                    idx0 = 1;
                    idx1 = 0;
                }
                break;
            }
            l = link.next;
        }

        Ok((tile.vert(poly.verts[idx0]), tile.vert(poly.verts[idx1])))
    }

    // ---- tile state snapshot ---------------------------------------------

    /// Serialises the non-structural state of a tile: per-polygon flags
    /// and area ids, guarded by the tile's current reference.
    pub fn store_tile_state(&self, tile_ref: TileRef) -> Result<Vec<u8>> {
        let it = self.tile_index_by_ref(tile_ref).ok_or(Status::InvalidParam)?;
        let tile = &self.tiles[it];
        let mut out = Vec::with_capacity(12 + tile.polys.len() * 3);
        out.extend_from_slice(&NAVMESH_STATE_MAGIC.to_le_bytes());
        out.extend_from_slice(&NAVMESH_STATE_VERSION.to_le_bytes());
        out.extend_from_slice(&tile_ref.id().to_le_bytes());
        for poly in &tile.polys {
            out.extend_from_slice(&poly.flags.bits().to_le_bytes());
            out.push(poly.area);
        }
        Ok(out)
    }

    /// Restores state captured by [`store_tile_state`](Self::store_tile_state).
    /// Fails if the tile's reference has changed since the snapshot.
    pub fn restore_tile_state(&mut self, tile_ref: TileRef, data: &[u8]) -> Result<()> {
        let it = self.tile_index_by_ref(tile_ref).ok_or(Status::InvalidParam)?;
        if data.len() < 12 {
            return Err(Status::InvalidParam);
        }
        let mut cur = Cursor::new(data);
        if cur.read_u32::<LittleEndian>()? != NAVMESH_STATE_MAGIC {
            return Err(Status::WrongMagic);
        }
        if cur.read_u32::<LittleEndian>()? != NAVMESH_STATE_VERSION {
            return Err(Status::WrongVersion);
        }
        if cur.read_u32::<LittleEndian>()? != tile_ref.id() {
            return Err(Status::InvalidParam);
        }
        let tile = &mut self.tiles[it];
        if data.len() < 12 + tile.polys.len() * 3 {
            return Err(Status::InvalidParam);
        }
        for poly in tile.polys.iter_mut() {
            poly.flags = PolyFlags::from_bits_retain(cur.read_u16::<LittleEndian>()?);
            poly.area = cur.read_u8()?;
        }
        Ok(())
    }
}

// ---- portal slab matching -----------------------------------------------

fn get_slab_coord(v: &[f32; 3], side: i32) -> f32 {
    if side == 0 || side == 4 {
        v[0]
    } else if side == 2 || side == 6 {
        v[2]
    } else {
        0.0
    }
}

/// Reduces a border edge to its 2-D slab: position along the border and
/// height, sorted min to max.
fn calc_slab_end_points(va: &[f32; 3], vb: &[f32; 3], side: i32) -> ([f32; 2], [f32; 2]) {
    if side == 0 || side == 4 {
        if va[2] < vb[2] {
            ([va[2], va[1]], [vb[2], vb[1]])
        } else {
            ([vb[2], vb[1]], [va[2], va[1]])
        }
    } else if side == 2 || side == 6 {
        if va[0] < vb[0] {
            ([va[0], va[1]], [vb[0], vb[1]])
        } else {
            ([vb[0], vb[1]], [va[0], va[1]])
        }
    } else {
        ([0.0, 0.0], [0.0, 0.0])
    }
}

/// Whether two portal slabs match: horizontal overlap after shrinking the
/// ends by `px`, and height segments that cross or come within a climb
/// threshold of each other.
fn overlap_slabs(amin: &[f32; 2], amax: &[f32; 2], bmin: &[f32; 2], bmax: &[f32; 2], px: f32, py: f32) -> bool {
    // Shrink the segments a little so slabs that merely touch at their
    // end points do not connect.
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    // Height interpolation at the overlap interval ends.
    let ad = (amax[1] - amin[1]) / (amax[0] - amin[0]);
    let ak = amin[1] - ad * amin[0];
    let bd = (bmax[1] - bmin[1]) / (bmax[0] - bmin[0]);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    // Crossing segments always overlap.
    if dmin * dmax < 0.0 {
        return true;
    }

    // Endpoint gaps within the climb threshold.
    let thr = sqr(py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

/// Finds polygons in `tile` whose border edges on `side` match the slab
/// of the edge `va`..`vb`. Returns up to [`MAX_CONNECTING_POLYS`] matches
/// with their 1-D overlap intervals.
fn find_connecting_polys(
    codec: &RefCodec,
    tile: &MeshTile,
    tile_index: usize,
    va: &[f32; 3],
    vb: &[f32; 3],
    side: i32,
) -> Vec<(PolyRef, f32, f32)> {
    let Some(header) = tile.header.as_ref() else {
        return Vec::new();
    };
    let (amin, amax) = calc_slab_end_points(va, vb, side);
    let apos = get_slab_coord(va, side);

    let m = EXT_LINK | side as u16;
    let base = codec.encode(tile.salt, tile_index as u32, 0);
    let mut out = Vec::new();

    for (i, poly) in tile.polys.iter().enumerate() {
        let nv = poly.vert_count as usize;
        for j in 0..nv {
            // Skip edges which do not point to the right side.
            if poly.neis[j] != m {
                continue;
            }
            let vc = tile.vert(poly.verts[j]);
            let vd = tile.vert(poly.verts[(j + 1) % nv]);

            // Segments are not close enough.
            if (apos - get_slab_coord(&vc, side)).abs() > 0.01 {
                continue;
            }

            let (bmin, bmax) = calc_slab_end_points(&vc, &vd, side);
            if !overlap_slabs(&amin, &amax, &bmin, &bmax, 0.01, header.walkable_climb) {
                continue;
            }

            if out.len() < MAX_CONNECTING_POLYS {
                out.push((
                    PolyRef(base.0 | i as u32),
                    amin[0].max(bmin[0]),
                    amax[0].min(bmax[0]),
                ));
            }
            break;
        }
    }
    out
}

// ---- per-tile query helpers ----------------------------------------------

fn query_polygons_in_tile(
    codec: &RefCodec,
    tile: &MeshTile,
    tile_index: usize,
    qmin: &[f32; 3],
    qmax: &[f32; 3],
    max_polys: usize,
) -> Vec<PolyRef> {
    let Some(header) = tile.header.as_ref() else {
        return Vec::new();
    };
    let base = codec.encode(tile.salt, tile_index as u32, 0);
    let mut out = Vec::new();

    if !tile.bv_tree.is_empty() {
        let tbmin = &header.bmin;
        let tbmax = &header.bmax;
        let qfac = header.bv_quant_factor;

        // Clamp the query box to the tile and quantise it, widening to the
        // nearest even/odd bound pair so the bounds stay inclusive.
        let minx = clamp(qmin[0], tbmin[0], tbmax[0]) - tbmin[0];
        let miny = clamp(qmin[1], tbmin[1], tbmax[1]) - tbmin[1];
        let minz = clamp(qmin[2], tbmin[2], tbmax[2]) - tbmin[2];
        let maxx = clamp(qmax[0], tbmin[0], tbmax[0]) - tbmin[0];
        let maxy = clamp(qmax[1], tbmin[1], tbmax[1]) - tbmin[1];
        let maxz = clamp(qmax[2], tbmin[2], tbmax[2]) - tbmin[2];
        let bmin = [
            (qfac * minx) as u16 & 0xfffe,
            (qfac * miny) as u16 & 0xfffe,
            (qfac * minz) as u16 & 0xfffe,
        ];
        let bmax = [
            (qfac * maxx + 1.0) as u16 | 1,
            (qfac * maxy + 1.0) as u16 | 1,
            (qfac * maxz + 1.0) as u16 | 1,
        ];

        // Front-to-back traversal over the escape-offset layout.
        let end = tile.bv_tree.len();
        let mut i = 0usize;
        while i < end {
            let node = &tile.bv_tree[i];
            let overlap = overlap_quant_bounds(&bmin, &bmax, &node.bmin, &node.bmax);
            let is_leaf = node.i >= 0;

            if is_leaf && overlap && out.len() < max_polys {
                out.push(PolyRef(base.0 | node.i as u32));
            }

            if overlap || is_leaf {
                i += 1;
            } else {
                i += (-node.i) as usize;
            }
        }
        return out;
    }

    // No tree: linear scan over polygon bounds.
    for (i, poly) in tile.polys.iter().enumerate() {
        if poly.poly_type == PolyType::OffMeshConnection {
            continue;
        }
        let mut bmin = tile.vert(poly.verts[0]);
        let mut bmax = bmin;
        for &v in &poly.verts[1..poly.vert_count as usize] {
            let p = tile.vert(v);
            tilenav_common::vmin(&mut bmin, &p);
            tilenav_common::vmax(&mut bmax, &p);
        }
        if overlap_bounds(qmin, qmax, &bmin, &bmax) && out.len() < max_polys {
            out.push(PolyRef(base.0 | i as u32));
        }
    }
    out
}

fn find_nearest_poly_in_tile(
    codec: &RefCodec,
    tile: &MeshTile,
    tile_index: usize,
    center: &[f32; 3],
    half_extents: &[f32; 3],
) -> Option<(PolyRef, [f32; 3])> {
    let header = tile.header.as_ref()?;
    let bmin = vsub(center, half_extents);
    let bmax = vadd(center, half_extents);

    let polys = query_polygons_in_tile(codec, tile, tile_index, &bmin, &bmax, MAX_NEAREST_CANDIDATES);

    let mut nearest: Option<(PolyRef, [f32; 3])> = None;
    let mut nearest_dist_sqr = f32::MAX;
    for r in polys {
        let ip = codec.decode_poly(r) as usize;
        let (closest, pos_over_poly) = closest_point_on_poly_in_tile(tile, ip, center);

        // A point directly over a polygon within climb height beats a
        // straight-line nearest point.
        let diff = vsub(center, &closest);
        let d = if pos_over_poly {
            let dy = diff[1].abs() - header.walkable_climb;
            if dy > 0.0 {
                dy * dy
            } else {
                0.0
            }
        } else {
            vlen_sqr(&diff)
        };

        if d < nearest_dist_sqr {
            nearest_dist_sqr = d;
            nearest = Some((r, closest));
        }
    }
    nearest
}

/// Which detail edges a closest-edge scan considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetailEdges {
    /// Only edges flagged as polygon boundary.
    Boundary,
    /// Every edge, deduplicating shared inner edges.
    Any,
}

fn detail_tri_vert(tile: &MeshTile, poly: &Poly, pd: &PolyDetail, k: u8) -> [f32; 3] {
    if k < poly.vert_count {
        tile.vert(poly.verts[k as usize])
    } else {
        let i = (pd.vert_base as usize + (k - poly.vert_count) as usize) * 3;
        [
            tile.detail_verts[i],
            tile.detail_verts[i + 1],
            tile.detail_verts[i + 2],
        ]
    }
}

fn closest_point_on_detail_edges(
    tile: &MeshTile,
    ip: usize,
    pos: &[f32; 3],
    edges: DetailEdges,
) -> [f32; 3] {
    let poly = &tile.polys[ip];
    let Some(pd) = tile.detail_meshes.get(ip) else {
        return *pos;
    };
    let only_boundary = edges == DetailEdges::Boundary;

    const ANY_BOUNDARY_EDGE: u8 =
        (DETAIL_EDGE_BOUNDARY) | (DETAIL_EDGE_BOUNDARY << 2) | (DETAIL_EDGE_BOUNDARY << 4);

    let mut dmin = f32::MAX;
    let mut tmin = 0.0f32;
    let mut best: Option<([f32; 3], [f32; 3])> = None;

    for i in 0..pd.tri_count as usize {
        let t = (pd.tri_base as usize + i) * 4;
        let tris = &tile.detail_tris[t..t + 4];
        if only_boundary && tris[3] & ANY_BOUNDARY_EDGE == 0 {
            continue;
        }

        let v = [
            detail_tri_vert(tile, poly, pd, tris[0]),
            detail_tri_vert(tile, poly, pd, tris[1]),
            detail_tri_vert(tile, poly, pd, tris[2]),
        ];

        let mut j = 2usize;
        for k in 0..3usize {
            let flags = (tris[3] >> (j * 2)) & 0x3;
            // Skip non-boundary edges in boundary mode, and inner edges
            // already seen from their lower-indexed side.
            if flags & DETAIL_EDGE_BOUNDARY == 0 && (only_boundary || tris[j] < tris[k]) {
                j = k;
                continue;
            }

            let (d, t) = dist_pt_seg_sqr_2d(pos, &v[j], &v[k]);
            if d < dmin {
                dmin = d;
                tmin = t;
                best = Some((v[j], v[k]));
            }
            j = k;
        }
    }

    match best {
        Some((a, b)) => vlerp(&a, &b, tmin),
        None => *pos,
    }
}

/// Height of the tile surface under `pos` within polygon `ip`, or `None`
/// when the point is outside the polygon footprint.
fn get_poly_height_in_tile(tile: &MeshTile, ip: usize, pos: &[f32; 3]) -> Option<f32> {
    let poly = &tile.polys[ip];
    // Off-mesh connections have no surface to measure against.
    if poly.poly_type == PolyType::OffMeshConnection {
        return None;
    }

    let nv = poly.vert_count as usize;
    let mut verts = [0.0f32; VERTS_PER_POLY * 3];
    for (i, &v) in poly.verts[..nv].iter().enumerate() {
        verts[i * 3..i * 3 + 3].copy_from_slice(&tile.vert(v));
    }
    if !point_in_polygon_2d(pos, &verts, nv) {
        return None;
    }

    let Some(pd) = tile.detail_meshes.get(ip) else {
        return Some(pos[1]);
    };
    for j in 0..pd.tri_count as usize {
        let t = (pd.tri_base as usize + j) * 4;
        let tris = &tile.detail_tris[t..t + 4];
        let v0 = detail_tri_vert(tile, poly, pd, tris[0]);
        let v1 = detail_tri_vert(tile, poly, pd, tris[1]);
        let v2 = detail_tri_vert(tile, poly, pd, tris[2]);
        if let Some(h) = closest_height_point_triangle(pos, &v0, &v1, &v2) {
            return Some(h);
        }
    }

    // All triangle tests failed (degenerate triangles or accumulated
    // error); the point sits on an edge, so take the closest one.
    let closest = closest_point_on_detail_edges(tile, ip, pos, DetailEdges::Any);
    Some(closest[1])
}

fn closest_point_on_poly_in_tile(tile: &MeshTile, ip: usize, pos: &[f32; 3]) -> ([f32; 3], bool) {
    if let Some(h) = get_poly_height_in_tile(tile, ip, pos) {
        return ([pos[0], h, pos[2]], true);
    }

    let poly = &tile.polys[ip];
    // Off-mesh connections have no detail polygons.
    if poly.poly_type == PolyType::OffMeshConnection {
        let v0 = tile.vert(poly.verts[0]);
        let v1 = tile.vert(poly.verts[1]);
        let (_, t) = dist_pt_seg_sqr_2d(pos, &v0, &v1);
        return (vlerp(&v0, &v1, t), false);
    }

    (
        closest_point_on_detail_edges(tile, ip, pos, DetailEdges::Boundary),
        false,
    )
}
