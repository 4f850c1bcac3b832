//! Tile payload assembly.
//!
//! Turns polygon-mesh input (vertices, polygons with neighbour codes,
//! optional detail meshes, off-mesh connections) into the binary tile
//! payload consumed by [`NavMesh::add_tile`](crate::NavMesh::add_tile).
//! Covers portal-edge accounting, off-mesh endpoint classification
//! against the tile bounds, fallback detail triangulation and BVH
//! construction.

use tilenav_common::{clamp, vmax, vmin};

use super::tile_data::{
    BvNode, Link, MeshHeader, OffMeshConnection, Poly, PolyDetail, PolyFlags, PolyType, TileData,
    NAVMESH_MAGIC, NAVMESH_VERSION,
};
use super::{Result, Status, EXT_LINK, NULL_LINK, VERTS_PER_POLY};

/// Empty slot marker in polygon vertex and neighbour arrays.
pub const MESH_NULL_IDX: u16 = 0xffff;

/// Input for [`create_nav_mesh_data`].
///
/// `polys` holds `poly_count * nvp * 2` entries: for each polygon, `nvp`
/// vertex indices (padded with [`MESH_NULL_IDX`]) followed by `nvp`
/// neighbour codes. A neighbour code is [`MESH_NULL_IDX`] for a hard
/// border, `EXT_LINK | dir` for a portal edge toward compass direction
/// `dir`, or the index of the adjacent polygon.
///
/// `detail_meshes` may be empty, in which case a triangle fan is
/// generated per polygon; when present it holds four entries per polygon
/// (vertex base, vertex count, triangle base, triangle count) into
/// `detail_verts`/`detail_tris`, with each polygon's own vertices stored
/// first in its detail vertex range.
#[derive(Debug, Clone, Default)]
pub struct NavMeshCreateParams {
    pub verts: Vec<f32>,
    pub vert_count: usize,
    pub polys: Vec<u16>,
    pub poly_flags: Vec<u16>,
    pub poly_areas: Vec<u8>,
    pub poly_count: usize,
    pub nvp: usize,

    pub detail_meshes: Vec<u32>,
    pub detail_verts: Vec<f32>,
    pub detail_vert_count: usize,
    pub detail_tris: Vec<u8>,
    pub detail_tri_count: usize,

    pub off_mesh_con_verts: Vec<f32>,
    pub off_mesh_con_rad: Vec<f32>,
    pub off_mesh_con_dir: Vec<u8>,
    pub off_mesh_con_areas: Vec<u8>,
    pub off_mesh_con_flags: Vec<u16>,
    pub off_mesh_con_user_id: Vec<u32>,
    pub off_mesh_con_count: usize,

    pub user_id: u32,
    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],

    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub cs: f32,
    pub ch: f32,
    pub build_bv_tree: bool,
}

/// Classifies a point against the tile bounds: the compass direction of
/// the side it leaves through, or 0xff when it lies inside.
fn classify_off_mesh_point(pt: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> u8 {
    const XP: u8 = 1 << 0;
    const ZP: u8 = 1 << 1;
    const XM: u8 = 1 << 2;
    const ZM: u8 = 1 << 3;

    let mut outcode = 0u8;
    outcode |= if pt[0] >= bmax[0] { XP } else { 0 };
    outcode |= if pt[2] >= bmax[2] { ZP } else { 0 };
    outcode |= if pt[0] < bmin[0] { XM } else { 0 };
    outcode |= if pt[2] < bmin[2] { ZM } else { 0 };

    match outcode {
        x if x == XP => 0,
        x if x == XP | ZP => 1,
        x if x == ZP => 2,
        x if x == XM | ZP => 3,
        x if x == XM => 4,
        x if x == XM | ZM => 5,
        x if x == ZM => 6,
        x if x == XP | ZM => 7,
        _ => 0xff,
    }
}

/// Builds a tile payload blob from polygon mesh input.
pub fn create_nav_mesh_data(params: &NavMeshCreateParams) -> Result<Vec<u8>> {
    if params.nvp == 0 || params.nvp > VERTS_PER_POLY {
        return Err(Status::InvalidParam);
    }
    if params.vert_count == 0 || params.vert_count >= 0xffff {
        return Err(Status::InvalidParam);
    }
    if params.poly_count == 0 {
        return Err(Status::InvalidParam);
    }
    if params.verts.len() < params.vert_count * 3
        || params.polys.len() < params.poly_count * params.nvp * 2
    {
        return Err(Status::InvalidParam);
    }

    let nvp = params.nvp;

    // Classify off-mesh connection endpoints against the tile footprint,
    // with the height interval tightened to the geometry.
    let mut off_mesh_class = vec![[0u8; 2]; params.off_mesh_con_count];
    let mut stored_off_mesh_count = 0usize;
    let mut off_mesh_link_count = 0usize;
    if params.off_mesh_con_count > 0 {
        let mut hmin = f32::MAX;
        let mut hmax = f32::MIN;
        if params.detail_vert_count > 0 {
            for i in 0..params.detail_vert_count {
                let h = params.detail_verts[i * 3 + 1];
                hmin = hmin.min(h);
                hmax = hmax.max(h);
            }
        } else {
            for i in 0..params.vert_count {
                let h = params.verts[i * 3 + 1];
                hmin = hmin.min(h);
                hmax = hmax.max(h);
            }
        }
        hmin -= params.walkable_climb;
        hmax += params.walkable_climb;
        let mut bmin = params.bmin;
        let mut bmax = params.bmax;
        bmin[1] = hmin;
        bmax[1] = hmax;

        for i in 0..params.off_mesh_con_count {
            let p0 = [
                params.off_mesh_con_verts[i * 6],
                params.off_mesh_con_verts[i * 6 + 1],
                params.off_mesh_con_verts[i * 6 + 2],
            ];
            let p1 = [
                params.off_mesh_con_verts[i * 6 + 3],
                params.off_mesh_con_verts[i * 6 + 4],
                params.off_mesh_con_verts[i * 6 + 5],
            ];
            off_mesh_class[i][0] = classify_off_mesh_point(&p0, &bmin, &bmax);
            off_mesh_class[i][1] = classify_off_mesh_point(&p1, &bmin, &bmax);

            // Cull start locations that cannot even touch the mesh height
            // interval.
            if off_mesh_class[i][0] == 0xff && (p0[1] < bmin[1] || p0[1] > bmax[1]) {
                off_mesh_class[i][0] = 0;
            }

            if off_mesh_class[i][0] == 0xff {
                off_mesh_link_count += 1;
                stored_off_mesh_count += 1;
            }
            if off_mesh_class[i][1] == 0xff {
                off_mesh_link_count += 1;
            }
        }
    }

    // Size the link pool: one link per connected edge, two per portal
    // edge, two per off-mesh endpoint landing in this tile.
    let mut edge_count = 0usize;
    let mut portal_count = 0usize;
    for i in 0..params.poly_count {
        let p = &params.polys[i * 2 * nvp..];
        for j in 0..nvp {
            if p[j] == MESH_NULL_IDX {
                break;
            }
            edge_count += 1;
            let nei = p[nvp + j];
            if nei & EXT_LINK != 0 && nei != MESH_NULL_IDX {
                portal_count += 1;
            }
        }
    }
    let max_link_count = edge_count + portal_count * 2 + off_mesh_link_count * 2;

    let tot_poly_count = params.poly_count + stored_off_mesh_count;
    let tot_vert_count = params.vert_count + stored_off_mesh_count * 2;

    // Vertices: mesh verts first, then two per stored off-mesh con.
    let mut verts = Vec::with_capacity(tot_vert_count * 3);
    verts.extend_from_slice(&params.verts[..params.vert_count * 3]);
    for i in 0..params.off_mesh_con_count {
        if off_mesh_class[i][0] == 0xff {
            verts.extend_from_slice(&params.off_mesh_con_verts[i * 6..i * 6 + 6]);
        }
    }

    // Ground polygons.
    let mut polys = Vec::with_capacity(tot_poly_count);
    for i in 0..params.poly_count {
        let src = &params.polys[i * 2 * nvp..];
        let mut poly = Poly {
            first_link: NULL_LINK,
            verts: [0; VERTS_PER_POLY],
            neis: [0; VERTS_PER_POLY],
            flags: PolyFlags::from_bits_retain(params.poly_flags.get(i).copied().unwrap_or(0)),
            vert_count: 0,
            area: params.poly_areas.get(i).copied().unwrap_or(0),
            poly_type: PolyType::Ground,
        };
        let mut nv = 0usize;
        for j in 0..nvp {
            if src[j] == MESH_NULL_IDX {
                break;
            }
            poly.verts[j] = src[j];
            let nei = src[nvp + j];
            poly.neis[j] = if nei == MESH_NULL_IDX {
                0 // hard border
            } else if nei & EXT_LINK != 0 {
                nei
            } else {
                nei + 1
            };
            nv += 1;
        }
        if nv < 3 {
            return Err(Status::InvalidParam);
        }
        poly.vert_count = nv as u8;
        polys.push(poly);
    }

    // Off-mesh connection polygons.
    let mut n = 0usize;
    for i in 0..params.off_mesh_con_count {
        if off_mesh_class[i][0] != 0xff {
            continue;
        }
        let mut poly = Poly {
            first_link: NULL_LINK,
            verts: [0; VERTS_PER_POLY],
            neis: [0; VERTS_PER_POLY],
            flags: PolyFlags::from_bits_retain(
                params.off_mesh_con_flags.get(i).copied().unwrap_or(0),
            ),
            vert_count: 2,
            area: params.off_mesh_con_areas.get(i).copied().unwrap_or(0),
            poly_type: PolyType::OffMeshConnection,
        };
        poly.verts[0] = (params.vert_count + n * 2) as u16;
        poly.verts[1] = (params.vert_count + n * 2 + 1) as u16;
        polys.push(poly);
        n += 1;
    }

    // Detail meshes: either caller-supplied (with the polygon's own
    // vertices compressed out) or a triangle fan per polygon.
    let mut detail_meshes = Vec::with_capacity(params.poly_count);
    let mut detail_verts = Vec::new();
    let mut detail_tris = Vec::new();
    if !params.detail_meshes.is_empty() {
        let mut vbase = 0u32;
        for i in 0..params.poly_count {
            let vb = params.detail_meshes[i * 4] as usize;
            let ndv = params.detail_meshes[i * 4 + 1] as usize;
            let nv = polys[i].vert_count as usize;
            if ndv < nv {
                return Err(Status::InvalidParam);
            }
            detail_meshes.push(PolyDetail {
                vert_base: vbase,
                tri_base: params.detail_meshes[i * 4 + 2],
                vert_count: (ndv - nv) as u8,
                tri_count: params.detail_meshes[i * 4 + 3] as u8,
            });
            // The first nv detail verts equal the polygon verts; store
            // only the extras.
            if ndv > nv {
                detail_verts
                    .extend_from_slice(&params.detail_verts[(vb + nv) * 3..(vb + ndv) * 3]);
                vbase += (ndv - nv) as u32;
            }
        }
        detail_tris.extend_from_slice(&params.detail_tris[..params.detail_tri_count * 4]);
    } else {
        for poly in polys.iter().take(params.poly_count) {
            let nv = poly.vert_count as usize;
            detail_meshes.push(PolyDetail {
                vert_base: 0,
                tri_base: (detail_tris.len() / 4) as u32,
                vert_count: 0,
                tri_count: (nv - 2) as u8,
            });
            // Triangulate as a fan; flag the fan edges lying on the
            // polygon boundary.
            for j in 2..nv {
                let mut flags = 1u8 << 2; // edge (j-1, j) is on the hull
                if j == 2 {
                    flags |= 1 << 0;
                }
                if j == nv - 1 {
                    flags |= 1 << 4;
                }
                detail_tris.push(0);
                detail_tris.push((j - 1) as u8);
                detail_tris.push(j as u8);
                detail_tris.push(flags);
            }
        }
    }

    // BVH over ground polygons.
    let mut bv_quant_factor = 0.0f32;
    let bv_tree = if params.build_bv_tree {
        bv_quant_factor = 1.0 / params.cs;
        create_bv_tree(params, &polys[..params.poly_count], bv_quant_factor)
    } else {
        Vec::new()
    };

    // Off-mesh connection descriptors.
    let mut off_mesh_cons = Vec::with_capacity(stored_off_mesh_count);
    let mut n = 0usize;
    for i in 0..params.off_mesh_con_count {
        if off_mesh_class[i][0] != 0xff {
            continue;
        }
        let mut pos = [0.0f32; 6];
        pos.copy_from_slice(&params.off_mesh_con_verts[i * 6..i * 6 + 6]);
        off_mesh_cons.push(OffMeshConnection {
            pos,
            radius: params.off_mesh_con_rad.get(i).copied().unwrap_or(0.0),
            poly: (params.poly_count + n) as u16,
            flags: params.off_mesh_con_dir.get(i).copied().unwrap_or(0),
            side: off_mesh_class[i][1],
            user_id: params.off_mesh_con_user_id.get(i).copied().unwrap_or(0),
        });
        n += 1;
    }

    let header = MeshHeader {
        magic: NAVMESH_MAGIC,
        version: NAVMESH_VERSION,
        x: params.tile_x,
        y: params.tile_y,
        layer: params.tile_layer,
        user_id: params.user_id,
        poly_count: tot_poly_count as i32,
        vert_count: tot_vert_count as i32,
        max_link_count: max_link_count as i32,
        detail_mesh_count: detail_meshes.len() as i32,
        detail_vert_count: (detail_verts.len() / 3) as i32,
        detail_tri_count: (detail_tris.len() / 4) as i32,
        bv_node_count: bv_tree.len() as i32,
        off_mesh_con_count: off_mesh_cons.len() as i32,
        off_mesh_base: params.poly_count as i32,
        walkable_height: params.walkable_height,
        walkable_radius: params.walkable_radius,
        walkable_climb: params.walkable_climb,
        bmin: params.bmin,
        bmax: params.bmax,
        bv_quant_factor,
    };

    let tile = TileData {
        header,
        verts,
        polys,
        links: vec![Link::default(); max_link_count],
        detail_meshes,
        detail_verts,
        detail_tris,
        bv_tree,
        off_mesh_cons,
    };
    Ok(tile.to_bytes())
}

struct BvItem {
    bmin: [u16; 3],
    bmax: [u16; 3],
    i: i32,
}

fn create_bv_tree(params: &NavMeshCreateParams, polys: &[Poly], quant: f32) -> Vec<BvNode> {
    let mut items = Vec::with_capacity(polys.len());
    for (i, poly) in polys.iter().enumerate() {
        let mut bmin = [f32::MAX; 3];
        let mut bmax = [f32::MIN; 3];
        for &v in &poly.verts[..poly.vert_count as usize] {
            let p = &params.verts[v as usize * 3..v as usize * 3 + 3];
            vmin(&mut bmin, p);
            vmax(&mut bmax, p);
        }
        items.push(BvItem {
            bmin: quantize(&bmin, &params.bmin, quant),
            bmax: quantize(&bmax, &params.bmin, quant),
            i: i as i32,
        });
    }

    let nitems = items.len();
    let mut nodes = Vec::with_capacity(nitems * 2);
    subdivide(&mut items, 0, nitems, &mut nodes);
    nodes
}

fn quantize(v: &[f32; 3], origin: &[f32; 3], quant: f32) -> [u16; 3] {
    let mut q = [0u16; 3];
    for i in 0..3 {
        q[i] = clamp((v[i] - origin[i]) * quant, 0.0, 65535.0) as u16;
    }
    q
}

fn calc_extends(items: &[BvItem], imin: usize, imax: usize) -> ([u16; 3], [u16; 3]) {
    let mut bmin = items[imin].bmin;
    let mut bmax = items[imin].bmax;
    for it in &items[imin + 1..imax] {
        for k in 0..3 {
            bmin[k] = bmin[k].min(it.bmin[k]);
            bmax[k] = bmax[k].max(it.bmax[k]);
        }
    }
    (bmin, bmax)
}

fn subdivide(items: &mut [BvItem], imin: usize, imax: usize, nodes: &mut Vec<BvNode>) {
    let inum = imax - imin;
    let icur = nodes.len();

    if inum == 1 {
        let it = &items[imin];
        nodes.push(BvNode {
            bmin: it.bmin,
            bmax: it.bmax,
            i: it.i,
        });
        return;
    }

    let (bmin, bmax) = calc_extends(items, imin, imax);
    nodes.push(BvNode {
        bmin,
        bmax,
        i: 0, // escape offset patched below
    });

    // Split at the median along the longest axis.
    let ext = [
        bmax[0] - bmin[0],
        bmax[1] - bmin[1],
        bmax[2] - bmin[2],
    ];
    let axis = if ext[1] > ext[0] && ext[1] > ext[2] {
        1
    } else if ext[2] > ext[0] {
        2
    } else {
        0
    };
    items[imin..imax].sort_by_key(|it| it.bmin[axis]);
    let isplit = imin + inum / 2;

    subdivide(items, imin, isplit, nodes);
    subdivide(items, isplit, imax, nodes);

    let iescape = (nodes.len() - icur) as i32;
    nodes[icur].i = -iescape;
}
