//! Layer rasterisers and the layer-to-polygon-mesh collaborator.
//!
//! Obstacles are stamped onto a decompressed layer by clearing the area
//! id of covered cells. Turning the stamped layer back into a polygon
//! mesh is the job of the [`LayerMesher`] collaborator; [`GridMesher`]
//! is the stock implementation, a greedy rectangle decomposition with
//! exact-edge adjacency and border portal marking.

use std::collections::HashMap;

use tilenav::{Result, EXT_LINK, MESH_NULL_IDX};
use tilenav_common::sqr;

use super::layer::TileCacheLayer;

/// Polygon mesh produced from a layer, still in grid units.
#[derive(Debug, Default)]
pub struct LayerPolyMesh {
    /// Vertices as (x, height, z) grid-coordinate triples.
    pub verts: Vec<u16>,
    pub nverts: usize,
    /// `npolys * nvp * 2` entries, vertex indices then neighbour codes,
    /// in the conventions of [`tilenav::NavMeshCreateParams`].
    pub polys: Vec<u16>,
    pub areas: Vec<u8>,
    pub flags: Vec<u16>,
    pub npolys: usize,
    pub nvp: usize,
}

/// Scratch buffers reused across rebuilds.
///
/// `reset` keeps the allocations, so after a warm-up the transient memory
/// of a rebuild is bounded by the largest layer processed.
#[derive(Debug, Default)]
pub struct BuildScratch {
    visited: Vec<bool>,
    rects: Vec<Rect>,
    vert_map: HashMap<(u16, u16, u16), u16>,
}

impl BuildScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.visited.clear();
        self.rects.clear();
        self.vert_map.clear();
    }
}

/// Converts a stamped layer into a polygon mesh.
pub trait LayerMesher {
    /// Builds a polygon mesh from the layer's walkable cells. An empty
    /// mesh (`npolys == 0`) is a valid result.
    fn build(
        &self,
        layer: &TileCacheLayer,
        walkable_climb: i32,
        scratch: &mut BuildScratch,
    ) -> Result<LayerPolyMesh>;
}

/// Post-processing hook over a freshly meshed tile's flags and areas.
pub trait MeshProcess {
    fn process(&mut self, areas: &mut [u8], flags: &mut [u16]);
}

#[derive(Debug, Clone, Copy)]
struct Rect {
    x0: u16,
    x1: u16,
    z0: u16,
    z1: u16,
    h: u8,
    area: u8,
}

/// Greedy rectangle mesher.
///
/// Merges runs of walkable cells with equal height and area id into
/// rectangles, row by row. Rectangles sharing an identical edge (both
/// vertices) become internal neighbours; edges on the layer border
/// become portal edges toward the matching compass direction.
#[derive(Debug, Default)]
pub struct GridMesher;

impl LayerMesher for GridMesher {
    fn build(
        &self,
        layer: &TileCacheLayer,
        _walkable_climb: i32,
        scratch: &mut BuildScratch,
    ) -> Result<LayerPolyMesh> {
        let w = layer.header.width as usize;
        let h = layer.header.height as usize;

        scratch.reset();
        scratch.visited.resize(w * h, false);

        // Decompose the walkable cells into rectangles.
        for z in 0..h {
            for x in 0..w {
                let idx = x + z * w;
                if scratch.visited[idx] || layer.areas[idx] == 0 {
                    continue;
                }
                let ch = layer.heights[idx];
                let ca = layer.areas[idx];

                let cell_matches = |xx: usize, zz: usize, scratch: &BuildScratch| {
                    let i = xx + zz * w;
                    !scratch.visited[i] && layer.areas[i] == ca && layer.heights[i] == ch
                };

                let mut x1 = x + 1;
                while x1 < w && cell_matches(x1, z, scratch) {
                    x1 += 1;
                }
                let mut z1 = z + 1;
                'rows: while z1 < h {
                    for xx in x..x1 {
                        if !cell_matches(xx, z1, scratch) {
                            break 'rows;
                        }
                    }
                    z1 += 1;
                }

                for zz in z..z1 {
                    for xx in x..x1 {
                        scratch.visited[xx + zz * w] = true;
                    }
                }
                scratch.rects.push(Rect {
                    x0: x as u16,
                    x1: x1 as u16,
                    z0: z as u16,
                    z1: z1 as u16,
                    h: ch,
                    area: ca,
                });
            }
        }

        let nvp = 4;
        let mut mesh = LayerPolyMesh {
            nvp,
            ..Default::default()
        };

        let vert_id = |mesh: &mut LayerPolyMesh,
                           scratch: &mut BuildScratch,
                           x: u16,
                           y: u16,
                           z: u16| {
            *scratch.vert_map.entry((x, y, z)).or_insert_with(|| {
                let id = mesh.nverts as u16;
                mesh.verts.extend_from_slice(&[x, y, z]);
                mesh.nverts += 1;
                id
            })
        };

        for rect in scratch.rects.clone() {
            let y = rect.h as u16;
            let quad = [
                vert_id(&mut mesh, scratch, rect.x0, y, rect.z0),
                vert_id(&mut mesh, scratch, rect.x0, y, rect.z1),
                vert_id(&mut mesh, scratch, rect.x1, y, rect.z1),
                vert_id(&mut mesh, scratch, rect.x1, y, rect.z0),
            ];
            mesh.polys.extend_from_slice(&quad);
            // Neighbour slots: portal codes on the layer border, no
            // neighbour elsewhere until the adjacency pass below.
            let mut neis = [MESH_NULL_IDX; 4];
            if rect.x0 == 0 {
                neis[0] = EXT_LINK | 4;
            }
            if rect.z1 == h as u16 {
                neis[1] = EXT_LINK | 2;
            }
            if rect.x1 == w as u16 {
                neis[2] = EXT_LINK;
            }
            if rect.z0 == 0 {
                neis[3] = EXT_LINK | 6;
            }
            mesh.polys.extend_from_slice(&neis);
            mesh.areas.push(rect.area);
            mesh.flags.push(0);
            mesh.npolys += 1;
        }

        // Exact-edge adjacency: rectangles sharing both vertices of an
        // edge become internal neighbours.
        let mut edge_owner: HashMap<(u16, u16), (usize, usize)> = HashMap::new();
        for p in 0..mesh.npolys {
            for j in 0..nvp {
                let va = mesh.polys[p * nvp * 2 + j];
                let vb = mesh.polys[p * nvp * 2 + (j + 1) % nvp];
                let key = (va.min(vb), va.max(vb));
                match edge_owner.get(&key) {
                    None => {
                        edge_owner.insert(key, (p, j));
                    }
                    Some(&(q, k)) => {
                        if mesh.polys[p * nvp * 2 + nvp + j] == MESH_NULL_IDX
                            && mesh.polys[q * nvp * 2 + nvp + k] == MESH_NULL_IDX
                        {
                            mesh.polys[p * nvp * 2 + nvp + j] = q as u16;
                            mesh.polys[q * nvp * 2 + nvp + k] = p as u16;
                        }
                    }
                }
            }
        }

        Ok(mesh)
    }
}

// ---- obstacle rasterisers -------------------------------------------------

/// Stamps a vertical cylinder onto the layer.
pub fn mark_cylinder_area(
    layer: &mut TileCacheLayer,
    orig: &[f32; 3],
    cs: f32,
    ch: f32,
    pos: &[f32; 3],
    radius: f32,
    height: f32,
    area_id: u8,
) {
    let bmin = [pos[0] - radius, pos[1], pos[2] - radius];
    let bmax = [pos[0] + radius, pos[1] + height, pos[2] + radius];
    // Test against the cell centre with half a cell of slack.
    let r2 = sqr(radius / cs + 0.5);

    let w = layer.header.width as i32;
    let h = layer.header.height as i32;
    let ics = 1.0 / cs;
    let ich = 1.0 / ch;
    let px = (pos[0] - orig[0]) * ics;
    let pz = (pos[2] - orig[2]) * ics;

    let mut minx = ((bmin[0] - orig[0]) * ics).floor() as i32;
    let miny = ((bmin[1] - orig[1]) * ich).floor() as i32;
    let mut minz = ((bmin[2] - orig[2]) * ics).floor() as i32;
    let mut maxx = ((bmax[0] - orig[0]) * ics).floor() as i32;
    let maxy = ((bmax[1] - orig[1]) * ich).floor() as i32;
    let mut maxz = ((bmax[2] - orig[2]) * ics).floor() as i32;

    if maxx < 0 || minx >= w || maxz < 0 || minz >= h {
        return;
    }
    minx = minx.max(0);
    maxx = maxx.min(w - 1);
    minz = minz.max(0);
    maxz = maxz.min(h - 1);

    for z in minz..=maxz {
        for x in minx..=maxx {
            let dx = (x as f32 + 0.5) - px;
            let dz = (z as f32 + 0.5) - pz;
            if dx * dx + dz * dz > r2 {
                continue;
            }
            let idx = (x + z * w) as usize;
            let y = layer.heights[idx] as i32;
            if y < miny || y > maxy {
                continue;
            }
            layer.areas[idx] = area_id;
        }
    }
}

/// Stamps an axis-aligned box onto the layer.
pub fn mark_box_area(
    layer: &mut TileCacheLayer,
    orig: &[f32; 3],
    cs: f32,
    ch: f32,
    bmin: &[f32; 3],
    bmax: &[f32; 3],
    area_id: u8,
) {
    let w = layer.header.width as i32;
    let h = layer.header.height as i32;
    let ics = 1.0 / cs;
    let ich = 1.0 / ch;

    let mut minx = ((bmin[0] - orig[0]) * ics).floor() as i32;
    let miny = ((bmin[1] - orig[1]) * ich).floor() as i32;
    let mut minz = ((bmin[2] - orig[2]) * ics).floor() as i32;
    let mut maxx = ((bmax[0] - orig[0]) * ics).floor() as i32;
    let maxy = ((bmax[1] - orig[1]) * ich).floor() as i32;
    let mut maxz = ((bmax[2] - orig[2]) * ics).floor() as i32;

    if maxx < 0 || minx >= w || maxz < 0 || minz >= h {
        return;
    }
    minx = minx.max(0);
    maxx = maxx.min(w - 1);
    minz = minz.max(0);
    maxz = maxz.min(h - 1);

    for z in minz..=maxz {
        for x in minx..=maxx {
            let idx = (x + z * w) as usize;
            let y = layer.heights[idx] as i32;
            if y < miny || y > maxy {
                continue;
            }
            layer.areas[idx] = area_id;
        }
    }
}

/// Stamps a y-axis-rotated box onto the layer.
///
/// `rot_aux` carries the half-angle auxiliaries
/// `[cos(a/2)*sin(-a/2), cos(a/2)*cos(a/2) - 0.5]` so the per-cell test
/// needs no trigonometry.
pub fn mark_oriented_box_area(
    layer: &mut TileCacheLayer,
    orig: &[f32; 3],
    cs: f32,
    ch: f32,
    center: &[f32; 3],
    half_extents: &[f32; 3],
    rot_aux: &[f32; 2],
    area_id: u8,
) {
    let w = layer.header.width as i32;
    let h = layer.header.height as i32;
    let ics = 1.0 / cs;
    let ich = 1.0 / ch;

    let cx = (center[0] - orig[0]) * ics;
    let cz = (center[2] - orig[2]) * ics;

    let maxr = 1.41 * half_extents[0].max(half_extents[2]);
    let mut minx = (cx - maxr * ics).floor() as i32;
    let mut maxx = (cx + maxr * ics).floor() as i32;
    let mut minz = (cz - maxr * ics).floor() as i32;
    let mut maxz = (cz + maxr * ics).floor() as i32;
    let miny = ((center[1] - half_extents[1] - orig[1]) * ich).floor() as i32;
    let maxy = ((center[1] + half_extents[1] - orig[1]) * ich).floor() as i32;

    if maxx < 0 || minx >= w || maxz < 0 || minz >= h {
        return;
    }
    minx = minx.max(0);
    maxx = maxx.min(w - 1);
    minz = minz.max(0);
    maxz = maxz.min(h - 1);

    let xhalf = half_extents[0] * ics + 0.5;
    let zhalf = half_extents[2] * ics + 0.5;

    for z in minz..=maxz {
        for x in minx..=maxx {
            let x2 = 2.0 * (x as f32 - cx);
            let z2 = 2.0 * (z as f32 - cz);
            let xrot = rot_aux[1] * x2 + rot_aux[0] * z2;
            if xrot > xhalf || xrot < -xhalf {
                continue;
            }
            let zrot = rot_aux[1] * z2 - rot_aux[0] * x2;
            if zrot > zhalf || zrot < -zhalf {
                continue;
            }
            let idx = (x + z * w) as usize;
            let y = layer.heights[idx] as i32;
            if y < miny || y > maxy {
                continue;
            }
            layer.areas[idx] = area_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerHeader, TILECACHE_MAGIC, TILECACHE_VERSION};

    fn flat_layer(size: u8) -> TileCacheLayer {
        let n = size as usize * size as usize;
        TileCacheLayer {
            header: LayerHeader {
                magic: TILECACHE_MAGIC,
                version: TILECACHE_VERSION,
                tx: 0,
                ty: 0,
                tlayer: 0,
                bmin: [0.0, 0.0, 0.0],
                bmax: [size as f32, 2.0, size as f32],
                hmin: 0,
                hmax: 1,
                width: size,
                height: size,
                minx: 0,
                maxx: size - 1,
                miny: 0,
                maxy: size - 1,
            },
            heights: vec![0; n],
            areas: vec![1; n],
            cons: vec![0; n],
        }
    }

    #[test]
    fn full_grid_meshes_to_one_portal_rimmed_quad() {
        let layer = flat_layer(8);
        let mut scratch = BuildScratch::new();
        let mesh = GridMesher.build(&layer, 1, &mut scratch).unwrap();

        assert_eq!(mesh.npolys, 1);
        assert_eq!(mesh.nverts, 4);
        let neis = &mesh.polys[4..8];
        assert_eq!(neis[0], EXT_LINK | 4);
        assert_eq!(neis[1], EXT_LINK | 2);
        assert_eq!(neis[2], EXT_LINK);
        assert_eq!(neis[3], EXT_LINK | 6);
    }

    #[test]
    fn cleared_cells_are_not_meshed() {
        let mut layer = flat_layer(8);
        mark_cylinder_area(
            &mut layer,
            &[0.0, 0.0, 0.0],
            1.0,
            1.0,
            &[4.0, 0.0, 4.0],
            1.5,
            2.0,
            0,
        );
        assert_eq!(layer.areas[4 + 4 * 8], 0);
        // A corner cell stays walkable.
        assert_eq!(layer.areas[0], 1);

        let mut scratch = BuildScratch::new();
        let mesh = GridMesher.build(&layer, 1, &mut scratch).unwrap();
        assert!(mesh.npolys > 1);

        // No polygon covers the cleared centre cell.
        for p in 0..mesh.npolys {
            let v0 = mesh.polys[p * 8] as usize;
            let v2 = mesh.polys[p * 8 + 2] as usize;
            let (x0, z0) = (mesh.verts[v0 * 3], mesh.verts[v0 * 3 + 2]);
            let (x1, z1) = (mesh.verts[v2 * 3], mesh.verts[v2 * 3 + 2]);
            let covers = x0 <= 4 && 5 <= x1 && z0 <= 4 && 5 <= z1;
            assert!(!covers, "polygon {p} covers the obstacle cell");
        }
    }

    #[test]
    fn rects_sharing_a_full_edge_are_linked() {
        let mut layer = flat_layer(4);
        // Split into two horizontal bands by area id.
        for z in 2..4 {
            for x in 0..4 {
                layer.areas[x + z * 4] = 2;
            }
        }
        let mut scratch = BuildScratch::new();
        let mesh = GridMesher.build(&layer, 1, &mut scratch).unwrap();

        assert_eq!(mesh.npolys, 2);
        // Band 0's far edge neighbours band 1, and vice versa.
        assert_eq!(mesh.polys[4 + 1], 1);
        assert_eq!(mesh.polys[8 + 4 + 3], 0);
        assert_eq!(mesh.areas, vec![1, 2]);
    }

    #[test]
    fn box_rasteriser_respects_height_interval() {
        let mut layer = flat_layer(4);
        // A box floating above the surface does not clear cells.
        mark_box_area(
            &mut layer,
            &[0.0, 0.0, 0.0],
            1.0,
            1.0,
            &[0.0, 5.0, 0.0],
            &[4.0, 6.0, 4.0],
            0,
        );
        assert!(layer.areas.iter().all(|&a| a == 1));

        mark_box_area(
            &mut layer,
            &[0.0, 0.0, 0.0],
            1.0,
            1.0,
            &[1.0, 0.0, 1.0],
            &[3.0, 1.0, 3.0],
            0,
        );
        assert_eq!(layer.areas[1 + 4], 0);
        assert_eq!(layer.areas[0], 1);
    }

    #[test]
    fn oriented_box_covers_rotated_footprint() {
        let mut layer = flat_layer(8);
        // A thin box rotated 45 degrees around y.
        let angle = std::f32::consts::FRAC_PI_4;
        let coshalf = (0.5 * angle).cos();
        let sinhalf = (-0.5 * angle).sin();
        let rot_aux = [coshalf * sinhalf, coshalf * coshalf - 0.5];
        mark_oriented_box_area(
            &mut layer,
            &[0.0, 0.0, 0.0],
            1.0,
            1.0,
            &[4.0, 0.5, 4.0],
            &[3.0, 1.0, 0.5],
            &rot_aux,
            0,
        );

        // The box diagonal is cleared, the perpendicular diagonal is not.
        assert_eq!(layer.areas[4 + 4 * 8], 0);
        assert_eq!(layer.areas[2 + 6 * 8], 0);
        assert_eq!(layer.areas[6 + 2 * 8], 0);
        assert_eq!(layer.areas[2 + 2 * 8], 1);
        assert_eq!(layer.areas[6 + 6 * 8], 1);
    }
}
