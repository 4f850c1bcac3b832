//! Tile payload data model and its binary format.
//!
//! A tile payload is a little-endian blob: a fixed header followed by
//! 4-byte-aligned sections for vertices, polygons, link records, detail
//! meshes, detail vertices, detail triangles, BVH nodes (possibly empty)
//! and off-mesh connection descriptors. [`TileData::from_bytes`] parses a
//! payload into owned, bounds-checked vectors; [`TileData::to_bytes`]
//! produces the same layout.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use tilenav_common::align4;

use super::{PolyRef, Result, Status, NULL_LINK, VERTS_PER_POLY};

/// Magic number identifying a navigation mesh tile payload.
pub const NAVMESH_MAGIC: u32 = 0x5641_4E54; // 'TNAV' in little-endian

/// Tile payload format version.
pub const NAVMESH_VERSION: u32 = 1;

/// Magic number identifying a tile state blob.
pub const NAVMESH_STATE_MAGIC: u32 = 0x5453_4E54; // 'TNST' in little-endian

/// Tile state blob format version.
pub const NAVMESH_STATE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 100;
const POLY_SIZE: usize = 32;
const LINK_SIZE: usize = 12;
const DETAIL_SIZE: usize = 10;
const BV_NODE_SIZE: usize = 16;
const OFF_MESH_CON_SIZE: usize = 36;

bitflags::bitflags! {
    /// Per-polygon capability flags used by query filters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PolyFlags: u16 {
        /// Ordinary walkable surface.
        const WALK = 0x01;
        /// Water surface.
        const SWIM = 0x02;
        /// Passes through a door.
        const DOOR = 0x04;
        /// Requires a jump to traverse.
        const JUMP = 0x08;
        /// Disabled polygon, skipped by queries.
        const DISABLED = 0x10;
        /// All flag bits.
        const ALL = 0xffff;
    }
}

bitflags::bitflags! {
    /// Tile-level flags supplied to `add_tile`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TileFlags: u8 {
        /// The navigation mesh owns the payload and drops it on removal;
        /// without this, `remove_tile` hands the payload back.
        const FREE_DATA = 0x01;
    }
}

/// Polygon kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum PolyType {
    /// Convex walkable surface polygon.
    Ground,
    /// Two-vertex off-mesh connection polygon.
    OffMeshConnection,
}

/// Tile payload header.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MeshHeader {
    /// Payload magic, [`NAVMESH_MAGIC`].
    pub magic: u32,
    /// Payload format version, [`NAVMESH_VERSION`].
    pub version: u32,
    /// Tile grid location.
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    /// User-defined tile id.
    pub user_id: u32,
    /// Number of polygons (ground and off-mesh).
    pub poly_count: i32,
    /// Number of vertices.
    pub vert_count: i32,
    /// Size of the link pool.
    pub max_link_count: i32,
    /// Number of detail mesh descriptors (one per ground polygon).
    pub detail_mesh_count: i32,
    /// Number of detail vertices.
    pub detail_vert_count: i32,
    /// Number of detail triangles.
    pub detail_tri_count: i32,
    /// Number of BVH nodes, zero when the tile carries no tree.
    pub bv_node_count: i32,
    /// Number of off-mesh connection descriptors.
    pub off_mesh_con_count: i32,
    /// Polygon index of the first off-mesh polygon.
    pub off_mesh_base: i32,
    /// Agent height the tile was built for.
    pub walkable_height: f32,
    /// Agent radius the tile was built for.
    pub walkable_radius: f32,
    /// Agent climb the tile was built for.
    pub walkable_climb: f32,
    /// Tile bounding box.
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// World-to-quantised scale of the BVH.
    pub bv_quant_factor: f32,
}

/// Polygon in a tile.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Poly {
    /// Head of the polygon's link chain, [`NULL_LINK`] when empty.
    pub first_link: u32,
    /// Indices into the tile vertex array.
    pub verts: [u16; VERTS_PER_POLY],
    /// Per-edge neighbour codes: 0 = hard border, k = internal neighbour
    /// k-1, `EXT_LINK | dir` = portal edge toward compass direction `dir`.
    pub neis: [u16; VERTS_PER_POLY],
    /// Capability flags.
    pub flags: PolyFlags,
    /// Number of vertices in use.
    pub vert_count: u8,
    /// Area id.
    pub area: u8,
    /// Polygon kind.
    pub poly_type: PolyType,
}

impl Poly {
    fn area_and_type(&self) -> u8 {
        let t = match self.poly_type {
            PolyType::Ground => 0u8,
            PolyType::OffMeshConnection => 1u8,
        };
        (self.area & 0x3f) | (t << 6)
    }
}

/// Directed adjacency record attached to a source polygon.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Link {
    /// Reference of the neighbour polygon.
    pub target: PolyRef,
    /// Next link in the owning polygon's chain, or in the free chain.
    pub next: u32,
    /// Source edge index, 0xff for the return edge of an off-mesh link.
    pub edge: u8,
    /// Compass direction of the portal, 0xff for internal and off-mesh
    /// links.
    pub side: u8,
    /// Quantised portal limits along the edge (0..255).
    pub bmin: u8,
    pub bmax: u8,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            target: PolyRef::NULL,
            next: NULL_LINK,
            edge: 0,
            side: 0,
            bmin: 0,
            bmax: 0,
        }
    }
}

/// Detail mesh descriptor for one ground polygon.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyDetail {
    /// First detail vertex.
    pub vert_base: u32,
    /// First detail triangle.
    pub tri_base: u32,
    /// Number of detail vertices.
    pub vert_count: u8,
    /// Number of detail triangles.
    pub tri_count: u8,
}

/// Bounding volume node with quantised bounds.
///
/// `i >= 0` marks a leaf holding polygon index `i`; `i < 0` marks an
/// internal node whose magnitude is the escape offset to its next
/// sibling.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BvNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    pub i: i32,
}

/// Off-mesh connection descriptor.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshConnection {
    /// Both endpoints, `[sx, sy, sz, ex, ey, ez]`.
    pub pos: [f32; 6],
    /// Snap radius around the endpoints.
    pub radius: f32,
    /// Index of the two-vertex off-mesh polygon inside the tile.
    pub poly: u16,
    /// Connection flags; bit [`super::OFFMESH_CON_BIDIR`] marks a
    /// bidirectional connection.
    pub flags: u8,
    /// Compass direction the far endpoint leaves the tile through, or
    /// 0xff for an intra-tile connection.
    pub side: u8,
    /// User-defined id.
    pub user_id: u32,
}

impl OffMeshConnection {
    /// Start endpoint (the one pinned inside the owning tile).
    pub fn start_pos(&self) -> [f32; 3] {
        [self.pos[0], self.pos[1], self.pos[2]]
    }

    /// End endpoint.
    pub fn end_pos(&self) -> [f32; 3] {
        [self.pos[3], self.pos[4], self.pos[5]]
    }

    /// Whether the connection can be traversed both ways.
    pub fn is_bidirectional(&self) -> bool {
        self.flags & super::OFFMESH_CON_BIDIR != 0
    }
}

/// Parsed tile payload.
#[derive(Debug, Clone)]
pub struct TileData {
    pub header: MeshHeader,
    /// Vertices as flat float triples.
    pub verts: Vec<f32>,
    pub polys: Vec<Poly>,
    /// Link pool, `max_link_count` records; re-laced on every add.
    pub links: Vec<Link>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<f32>,
    /// Detail triangles, four bytes per triangle: three vertex indices and
    /// an edge-flags byte.
    pub detail_tris: Vec<u8>,
    /// BVH nodes; empty when the tile carries no tree.
    pub bv_tree: Vec<BvNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

impl TileData {
    /// Parses a payload, validating magic, version and every index the
    /// sections carry.
    pub fn from_bytes(data: &[u8]) -> Result<TileData> {
        if data.len() < 8 {
            return Err(Status::InvalidParam);
        }
        let mut cur = Cursor::new(data);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != NAVMESH_MAGIC {
            return Err(Status::WrongMagic);
        }
        let version = cur.read_u32::<LittleEndian>()?;
        if version != NAVMESH_VERSION {
            return Err(Status::WrongVersion);
        }
        if data.len() < HEADER_SIZE {
            return Err(Status::InvalidParam);
        }

        let header = MeshHeader {
            magic,
            version,
            x: cur.read_i32::<LittleEndian>()?,
            y: cur.read_i32::<LittleEndian>()?,
            layer: cur.read_i32::<LittleEndian>()?,
            user_id: cur.read_u32::<LittleEndian>()?,
            poly_count: cur.read_i32::<LittleEndian>()?,
            vert_count: cur.read_i32::<LittleEndian>()?,
            max_link_count: cur.read_i32::<LittleEndian>()?,
            detail_mesh_count: cur.read_i32::<LittleEndian>()?,
            detail_vert_count: cur.read_i32::<LittleEndian>()?,
            detail_tri_count: cur.read_i32::<LittleEndian>()?,
            bv_node_count: cur.read_i32::<LittleEndian>()?,
            off_mesh_con_count: cur.read_i32::<LittleEndian>()?,
            off_mesh_base: cur.read_i32::<LittleEndian>()?,
            walkable_height: cur.read_f32::<LittleEndian>()?,
            walkable_radius: cur.read_f32::<LittleEndian>()?,
            walkable_climb: cur.read_f32::<LittleEndian>()?,
            bmin: read_vec3(&mut cur)?,
            bmax: read_vec3(&mut cur)?,
            bv_quant_factor: cur.read_f32::<LittleEndian>()?,
        };

        if header.poly_count < 0
            || header.vert_count < 0
            || header.max_link_count < 0
            || header.detail_mesh_count < 0
            || header.detail_vert_count < 0
            || header.detail_tri_count < 0
            || header.bv_node_count < 0
            || header.off_mesh_con_count < 0
            || header.off_mesh_base < 0
            || header.off_mesh_base > header.poly_count
        {
            return Err(Status::InvalidParam);
        }

        // Section offsets, each rounded to a 4-byte boundary.
        let mut offset = align4(HEADER_SIZE);
        let verts_off = offset;
        offset += align4(header.vert_count as usize * 12);
        let polys_off = offset;
        offset += align4(header.poly_count as usize * POLY_SIZE);
        let links_off = offset;
        offset += align4(header.max_link_count as usize * LINK_SIZE);
        let details_off = offset;
        offset += align4(header.detail_mesh_count as usize * DETAIL_SIZE);
        let dverts_off = offset;
        offset += align4(header.detail_vert_count as usize * 12);
        let dtris_off = offset;
        offset += align4(header.detail_tri_count as usize * 4);
        let bv_off = offset;
        offset += align4(header.bv_node_count as usize * BV_NODE_SIZE);
        let offmesh_off = offset;
        offset += align4(header.off_mesh_con_count as usize * OFF_MESH_CON_SIZE);

        if data.len() < offset {
            return Err(Status::InvalidParam);
        }

        cur.set_position(verts_off as u64);
        let mut verts = Vec::with_capacity(header.vert_count as usize * 3);
        for _ in 0..header.vert_count as usize * 3 {
            verts.push(cur.read_f32::<LittleEndian>()?);
        }

        cur.set_position(polys_off as u64);
        let mut polys = Vec::with_capacity(header.poly_count as usize);
        for _ in 0..header.poly_count {
            polys.push(read_poly(&mut cur)?);
        }

        // The link pool carries no persistent content; it is rebuilt when
        // the tile is added. Only its size matters.
        let links = vec![Link::default(); header.max_link_count as usize];
        cur.set_position(links_off as u64);

        cur.set_position(details_off as u64);
        let mut detail_meshes = Vec::with_capacity(header.detail_mesh_count as usize);
        for _ in 0..header.detail_mesh_count {
            detail_meshes.push(PolyDetail {
                vert_base: cur.read_u32::<LittleEndian>()?,
                tri_base: cur.read_u32::<LittleEndian>()?,
                vert_count: cur.read_u8()?,
                tri_count: cur.read_u8()?,
            });
        }

        cur.set_position(dverts_off as u64);
        let mut detail_verts = Vec::with_capacity(header.detail_vert_count as usize * 3);
        for _ in 0..header.detail_vert_count as usize * 3 {
            detail_verts.push(cur.read_f32::<LittleEndian>()?);
        }

        cur.set_position(dtris_off as u64);
        let mut detail_tris = Vec::with_capacity(header.detail_tri_count as usize * 4);
        for _ in 0..header.detail_tri_count as usize * 4 {
            detail_tris.push(cur.read_u8()?);
        }

        cur.set_position(bv_off as u64);
        let mut bv_tree = Vec::with_capacity(header.bv_node_count as usize);
        for _ in 0..header.bv_node_count {
            bv_tree.push(BvNode {
                bmin: [
                    cur.read_u16::<LittleEndian>()?,
                    cur.read_u16::<LittleEndian>()?,
                    cur.read_u16::<LittleEndian>()?,
                ],
                bmax: [
                    cur.read_u16::<LittleEndian>()?,
                    cur.read_u16::<LittleEndian>()?,
                    cur.read_u16::<LittleEndian>()?,
                ],
                i: cur.read_i32::<LittleEndian>()?,
            });
        }

        cur.set_position(offmesh_off as u64);
        let mut off_mesh_cons = Vec::with_capacity(header.off_mesh_con_count as usize);
        for _ in 0..header.off_mesh_con_count {
            let mut pos = [0.0f32; 6];
            for p in &mut pos {
                *p = cur.read_f32::<LittleEndian>()?;
            }
            off_mesh_cons.push(OffMeshConnection {
                pos,
                radius: cur.read_f32::<LittleEndian>()?,
                poly: cur.read_u16::<LittleEndian>()?,
                flags: cur.read_u8()?,
                side: cur.read_u8()?,
                user_id: cur.read_u32::<LittleEndian>()?,
            });
        }

        let tile = TileData {
            header,
            verts,
            polys,
            links,
            detail_meshes,
            detail_verts,
            detail_tris,
            bv_tree,
            off_mesh_cons,
        };
        tile.validate_indices()?;
        Ok(tile)
    }

    /// Serialises the tile into the aligned-section payload layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let h = &self.header;
        let total = align4(HEADER_SIZE)
            + align4(h.vert_count as usize * 12)
            + align4(h.poly_count as usize * POLY_SIZE)
            + align4(h.max_link_count as usize * LINK_SIZE)
            + align4(h.detail_mesh_count as usize * DETAIL_SIZE)
            + align4(h.detail_vert_count as usize * 12)
            + align4(h.detail_tri_count as usize * 4)
            + align4(h.bv_node_count as usize * BV_NODE_SIZE)
            + align4(h.off_mesh_con_count as usize * OFF_MESH_CON_SIZE);
        let mut out = Vec::with_capacity(total);

        write_header(&mut out, h);
        pad4(&mut out);
        for v in &self.verts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        pad4(&mut out);
        for p in &self.polys {
            write_poly(&mut out, p);
        }
        pad4(&mut out);
        for l in &self.links {
            out.extend_from_slice(&l.target.0.to_le_bytes());
            out.extend_from_slice(&l.next.to_le_bytes());
            out.push(l.edge);
            out.push(l.side);
            out.push(l.bmin);
            out.push(l.bmax);
        }
        pad4(&mut out);
        for d in &self.detail_meshes {
            out.extend_from_slice(&d.vert_base.to_le_bytes());
            out.extend_from_slice(&d.tri_base.to_le_bytes());
            out.push(d.vert_count);
            out.push(d.tri_count);
        }
        pad4(&mut out);
        for v in &self.detail_verts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        pad4(&mut out);
        out.extend_from_slice(&self.detail_tris);
        pad4(&mut out);
        for n in &self.bv_tree {
            for c in n.bmin.iter().chain(n.bmax.iter()) {
                out.extend_from_slice(&c.to_le_bytes());
            }
            out.extend_from_slice(&n.i.to_le_bytes());
        }
        pad4(&mut out);
        for c in &self.off_mesh_cons {
            for p in &c.pos {
                out.extend_from_slice(&p.to_le_bytes());
            }
            out.extend_from_slice(&c.radius.to_le_bytes());
            out.extend_from_slice(&c.poly.to_le_bytes());
            out.push(c.flags);
            out.push(c.side);
            out.extend_from_slice(&c.user_id.to_le_bytes());
        }
        pad4(&mut out);
        out
    }

    fn validate_indices(&self) -> Result<()> {
        let nverts = self.verts.len() / 3;
        for poly in &self.polys {
            let nv = poly.vert_count as usize;
            if nv < 2 || nv > VERTS_PER_POLY {
                return Err(Status::InvalidParam);
            }
            for &v in &poly.verts[..nv] {
                if v as usize >= nverts {
                    return Err(Status::InvalidParam);
                }
            }
        }
        let ndverts = self.detail_verts.len() / 3;
        let ndtris = self.detail_tris.len() / 4;
        for d in &self.detail_meshes {
            if d.vert_base as usize + d.vert_count as usize > ndverts
                || d.tri_base as usize + d.tri_count as usize > ndtris
            {
                return Err(Status::InvalidParam);
            }
        }
        for con in &self.off_mesh_cons {
            if con.poly as usize >= self.polys.len() {
                return Err(Status::InvalidParam);
            }
        }
        Ok(())
    }
}

fn read_vec3(cur: &mut Cursor<&[u8]>) -> Result<[f32; 3]> {
    Ok([
        cur.read_f32::<LittleEndian>()?,
        cur.read_f32::<LittleEndian>()?,
        cur.read_f32::<LittleEndian>()?,
    ])
}

fn read_poly(cur: &mut Cursor<&[u8]>) -> Result<Poly> {
    let first_link = cur.read_u32::<LittleEndian>()?;
    let mut verts = [0u16; VERTS_PER_POLY];
    for v in &mut verts {
        *v = cur.read_u16::<LittleEndian>()?;
    }
    let mut neis = [0u16; VERTS_PER_POLY];
    for n in &mut neis {
        *n = cur.read_u16::<LittleEndian>()?;
    }
    let flags = PolyFlags::from_bits_retain(cur.read_u16::<LittleEndian>()?);
    let vert_count = cur.read_u8()?;
    let area_and_type = cur.read_u8()?;
    Ok(Poly {
        first_link,
        verts,
        neis,
        flags,
        vert_count,
        area: area_and_type & 0x3f,
        poly_type: if area_and_type >> 6 == 1 {
            PolyType::OffMeshConnection
        } else {
            PolyType::Ground
        },
    })
}

fn write_header(out: &mut Vec<u8>, h: &MeshHeader) {
    out.extend_from_slice(&h.magic.to_le_bytes());
    out.extend_from_slice(&h.version.to_le_bytes());
    out.extend_from_slice(&h.x.to_le_bytes());
    out.extend_from_slice(&h.y.to_le_bytes());
    out.extend_from_slice(&h.layer.to_le_bytes());
    out.extend_from_slice(&h.user_id.to_le_bytes());
    out.extend_from_slice(&h.poly_count.to_le_bytes());
    out.extend_from_slice(&h.vert_count.to_le_bytes());
    out.extend_from_slice(&h.max_link_count.to_le_bytes());
    out.extend_from_slice(&h.detail_mesh_count.to_le_bytes());
    out.extend_from_slice(&h.detail_vert_count.to_le_bytes());
    out.extend_from_slice(&h.detail_tri_count.to_le_bytes());
    out.extend_from_slice(&h.bv_node_count.to_le_bytes());
    out.extend_from_slice(&h.off_mesh_con_count.to_le_bytes());
    out.extend_from_slice(&h.off_mesh_base.to_le_bytes());
    out.extend_from_slice(&h.walkable_height.to_le_bytes());
    out.extend_from_slice(&h.walkable_radius.to_le_bytes());
    out.extend_from_slice(&h.walkable_climb.to_le_bytes());
    for v in h.bmin.iter().chain(h.bmax.iter()) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&h.bv_quant_factor.to_le_bytes());
}

fn write_poly(out: &mut Vec<u8>, p: &Poly) {
    out.extend_from_slice(&p.first_link.to_le_bytes());
    for &v in &p.verts {
        out.extend_from_slice(&v.to_le_bytes());
    }
    for &n in &p.neis {
        out.extend_from_slice(&n.to_le_bytes());
    }
    out.extend_from_slice(&p.flags.bits().to_le_bytes());
    out.push(p.vert_count);
    out.push(p.area_and_type());
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tile() -> TileData {
        let verts = vec![
            0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 10.0, 0.0, 10.0, 0.0, 0.0, 10.0,
        ];
        let mut poly = Poly {
            first_link: NULL_LINK,
            verts: [0; VERTS_PER_POLY],
            neis: [0; VERTS_PER_POLY],
            flags: PolyFlags::WALK,
            vert_count: 4,
            area: 3,
            poly_type: PolyType::Ground,
        };
        poly.verts[..4].copy_from_slice(&[0, 1, 2, 3]);
        TileData {
            header: MeshHeader {
                magic: NAVMESH_MAGIC,
                version: NAVMESH_VERSION,
                x: 2,
                y: -1,
                layer: 0,
                user_id: 7,
                poly_count: 1,
                vert_count: 4,
                max_link_count: 4,
                detail_mesh_count: 1,
                detail_vert_count: 0,
                detail_tri_count: 2,
                bv_node_count: 0,
                off_mesh_con_count: 0,
                off_mesh_base: 1,
                walkable_height: 2.0,
                walkable_radius: 0.6,
                walkable_climb: 0.9,
                bmin: [0.0, 0.0, 0.0],
                bmax: [10.0, 1.0, 10.0],
                bv_quant_factor: 0.0,
            },
            verts,
            polys: vec![poly],
            links: vec![Link::default(); 4],
            detail_meshes: vec![PolyDetail {
                vert_base: 0,
                tri_base: 0,
                vert_count: 0,
                tri_count: 2,
            }],
            detail_verts: Vec::new(),
            detail_tris: vec![0, 1, 2, 0, 0, 2, 3, 0],
            bv_tree: Vec::new(),
            off_mesh_cons: Vec::new(),
        }
    }

    #[test]
    fn payload_round_trip() {
        let tile = sample_tile();
        let bytes = tile.to_bytes();
        assert_eq!(bytes.len() % 4, 0);
        let parsed = TileData::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.header.x, 2);
        assert_eq!(parsed.header.y, -1);
        assert_eq!(parsed.polys.len(), 1);
        assert_eq!(parsed.polys[0].vert_count, 4);
        assert_eq!(parsed.polys[0].area, 3);
        assert_eq!(parsed.polys[0].poly_type, PolyType::Ground);
        assert_eq!(parsed.verts, tile.verts);
        assert_eq!(parsed.detail_tris, tile.detail_tris);
        assert_eq!(parsed.links.len(), 4);
    }

    #[test]
    fn wrong_magic_and_version() {
        let tile = sample_tile();
        let mut bytes = tile.to_bytes();
        bytes[0] ^= 0xff;
        assert_eq!(TileData::from_bytes(&bytes).err(), Some(Status::WrongMagic));

        let mut bytes = tile.to_bytes();
        bytes[4] = 0xfe;
        assert_eq!(TileData::from_bytes(&bytes).err(), Some(Status::WrongVersion));
    }

    #[test]
    fn truncated_payload_is_invalid() {
        let bytes = sample_tile().to_bytes();
        assert_eq!(
            TileData::from_bytes(&bytes[..bytes.len() - 8]).err(),
            Some(Status::InvalidParam)
        );
        assert_eq!(TileData::from_bytes(&[]).err(), Some(Status::InvalidParam));
    }

    #[test]
    fn out_of_range_vertex_index_is_invalid() {
        let mut tile = sample_tile();
        tile.polys[0].verts[2] = 9;
        let bytes = tile.to_bytes();
        assert_eq!(TileData::from_bytes(&bytes).err(), Some(Status::InvalidParam));
    }
}
