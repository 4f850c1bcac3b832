//! End-to-end tests for the obstacle request pipeline and incremental
//! tile rebuilds.

#[cfg(test)]
mod tests {
    use crate::{
        build_tile_cache_layer, CompressedTileFlags, GridMesher, LayerHeader, Lz4Compressor,
        ObstacleState, TileCache, TileCacheParams, TILECACHE_MAGIC, TILECACHE_VERSION,
    };
    use tilenav::{MeshTile, NavMesh, NavMeshParams, PolyType, Status};
    use tilenav_common::point_in_polygon_2d;

    const TILE_CELLS: u8 = 8;

    fn layer_header(tx: i32, ty: i32) -> LayerHeader {
        let w = TILE_CELLS as f32;
        LayerHeader {
            magic: TILECACHE_MAGIC,
            version: TILECACHE_VERSION,
            tx,
            ty,
            tlayer: 0,
            bmin: [tx as f32 * w, 0.0, ty as f32 * w],
            bmax: [(tx + 1) as f32 * w, 2.0, (ty + 1) as f32 * w],
            hmin: 0,
            hmax: 1,
            width: TILE_CELLS,
            height: TILE_CELLS,
            minx: 0,
            maxx: TILE_CELLS - 1,
            miny: 0,
            maxy: TILE_CELLS - 1,
        }
    }

    fn flat_layer_data(tx: i32, ty: i32) -> Vec<u8> {
        let n = TILE_CELLS as usize * TILE_CELLS as usize;
        build_tile_cache_layer(
            &Lz4Compressor,
            &layer_header(tx, ty),
            &vec![0u8; n],
            &vec![1u8; n],
            &vec![0u8; n],
        )
        .unwrap()
    }

    fn cache_params() -> TileCacheParams {
        TileCacheParams {
            orig: [0.0, 0.0, 0.0],
            cs: 1.0,
            ch: 1.0,
            width: TILE_CELLS as i32,
            height: TILE_CELLS as i32,
            walkable_height: 2.0,
            walkable_radius: 0.5,
            walkable_climb: 0.9,
            max_tiles: 8,
            max_obstacles: 100,
        }
    }

    /// Cache with two side-by-side tiles, primed into a fresh nav mesh.
    fn two_tile_setup() -> (TileCache, NavMesh) {
        let mut cache = TileCache::new(
            cache_params(),
            Box::new(Lz4Compressor),
            Box::new(GridMesher),
            None,
        )
        .unwrap();
        cache
            .add_tile(flat_layer_data(0, 0), CompressedTileFlags::FREE_DATA)
            .unwrap();
        cache
            .add_tile(flat_layer_data(1, 0), CompressedTileFlags::FREE_DATA)
            .unwrap();

        let mut nav = NavMesh::new(&NavMeshParams {
            orig: [0.0, 0.0, 0.0],
            tile_width: TILE_CELLS as f32,
            tile_height: TILE_CELLS as f32,
            max_tiles: 8,
            max_polys: 64,
        })
        .unwrap();
        cache.build_nav_mesh_tiles_at(0, 0, &mut nav).unwrap();
        cache.build_nav_mesh_tiles_at(1, 0, &mut nav).unwrap();
        (cache, nav)
    }

    /// True when some ground polygon's footprint contains the point.
    fn covered(tile: &MeshTile, p: &[f32; 3]) -> bool {
        for poly in &tile.polys {
            if poly.poly_type != PolyType::Ground {
                continue;
            }
            let nv = poly.vert_count as usize;
            let mut verts = [0.0f32; 6 * 3];
            for (i, &v) in poly.verts[..nv].iter().enumerate() {
                verts[i * 3] = tile.verts[v as usize * 3];
                verts[i * 3 + 1] = tile.verts[v as usize * 3 + 1];
                verts[i * 3 + 2] = tile.verts[v as usize * 3 + 2];
            }
            if point_in_polygon_2d(p, &verts, nv) {
                return true;
            }
        }
        false
    }

    fn drain(cache: &mut TileCache, nav: &mut NavMesh) -> usize {
        let mut steps = 0;
        loop {
            let done = cache.update(0.1, nav).unwrap();
            steps += 1;
            assert!(steps < 16, "update loop failed to settle");
            if done {
                return steps;
            }
        }
    }

    // Obstacle churn across a shared tile edge.
    #[test]
    fn obstacle_add_and_remove_rebuilds_both_tiles() {
        let (mut cache, mut nav) = two_tile_setup();

        let probe_a = [7.5, 0.0, 4.5];
        let probe_b = [8.5, 0.0, 4.5];
        let corner = [0.5, 0.0, 0.5];
        assert!(covered(nav.get_tile_at(0, 0, 0).unwrap(), &probe_a));
        assert!(covered(nav.get_tile_at(1, 0, 0).unwrap(), &probe_b));

        let before_verts = nav.get_tile_at(0, 0, 0).unwrap().verts.clone();

        // A cylinder straddling the shared edge touches both tiles.
        let ob = cache.add_obstacle([8.0, 0.0, 4.0], 2.0, 2.0).unwrap();
        assert_eq!(
            cache.get_obstacle_by_ref(ob).unwrap().state,
            ObstacleState::Processing
        );

        // One rebuild per call: two touched tiles, two calls.
        assert_eq!(drain(&mut cache, &mut nav), 2);

        let o = cache.get_obstacle_by_ref(ob).unwrap();
        assert_eq!(o.state, ObstacleState::Processed);
        assert_eq!(o.touched.len(), 2);

        // The mesh no longer covers the obstacle footprint, but the rest
        // of the tile is intact.
        assert!(!covered(nav.get_tile_at(0, 0, 0).unwrap(), &probe_a));
        assert!(!covered(nav.get_tile_at(1, 0, 0).unwrap(), &probe_b));
        assert!(covered(nav.get_tile_at(0, 0, 0).unwrap(), &corner));

        // Removal restores the original polygons.
        cache.remove_obstacle(ob).unwrap();
        assert_eq!(drain(&mut cache, &mut nav), 2);

        assert!(covered(nav.get_tile_at(0, 0, 0).unwrap(), &probe_a));
        assert!(covered(nav.get_tile_at(1, 0, 0).unwrap(), &probe_b));
        assert_eq!(nav.get_tile_at(0, 0, 0).unwrap().verts, before_verts);

        // The slot was recycled and the stale ref died with it.
        assert!(cache.get_obstacle_by_ref(ob).is_none());
        assert_eq!(cache.get_obstacle_count(), 0);
    }

    #[test]
    fn remove_while_processing_cancels_cleanly() {
        let (mut cache, mut nav) = two_tile_setup();
        let probe = [7.5, 0.0, 4.5];

        let ob = cache.add_obstacle([8.0, 0.0, 4.0], 2.0, 2.0).unwrap();
        // Cancel before any update ran; the drain sees ADD then REMOVE.
        cache.remove_obstacle(ob).unwrap();
        drain(&mut cache, &mut nav);

        // The mesh never lost the footprint and the obstacle is gone.
        assert!(covered(nav.get_tile_at(0, 0, 0).unwrap(), &probe));
        assert!(cache.get_obstacle_by_ref(ob).is_none());
        assert_eq!(cache.get_obstacle_count(), 0);
    }

    #[test]
    fn request_queue_saturation_reports_buffer_too_small() {
        let (mut cache, _nav) = two_tile_setup();

        for i in 0..crate::MAX_REQUESTS {
            cache
                .add_obstacle([i as f32, 0.0, 0.0], 0.5, 1.0)
                .unwrap();
        }
        let count = cache.get_obstacle_count();

        assert_eq!(
            cache.add_obstacle([0.0, 0.0, 0.0], 0.5, 1.0).err(),
            Some(Status::BufferTooSmall)
        );
        // The failed add changed nothing.
        assert_eq!(cache.get_obstacle_count(), count);

        let victim = cache.get_obstacle_ref(0).unwrap();
        assert_eq!(
            cache.remove_obstacle(victim).err(),
            Some(Status::BufferTooSmall)
        );
    }

    #[test]
    fn cache_tile_add_checks_magic_and_occupancy() {
        let mut cache = TileCache::new(
            cache_params(),
            Box::new(Lz4Compressor),
            Box::new(GridMesher),
            None,
        )
        .unwrap();

        let data = flat_layer_data(0, 0);
        let mut bad = data.clone();
        bad[0] ^= 0xff;
        assert_eq!(
            cache.add_tile(bad, CompressedTileFlags::empty()).err(),
            Some(Status::WrongMagic)
        );

        let r = cache.add_tile(data.clone(), CompressedTileFlags::empty()).unwrap();
        assert_eq!(
            cache.add_tile(data, CompressedTileFlags::empty()).err(),
            Some(Status::AlreadyOccupied)
        );

        // Removing hands the caller-owned payload back and kills the ref.
        let returned = cache.remove_tile(r).unwrap();
        assert!(returned.is_some());
        assert!(cache.get_tile_by_ref(r).is_none());
        assert!(cache.get_tile_at(0, 0, 0).is_none());
    }

    #[test]
    fn query_tiles_filters_by_bounds() {
        let (cache, _nav) = two_tile_setup();

        // A box inside the first tile only.
        let hits = cache.query_tiles(&[1.0, 0.0, 1.0], &[3.0, 1.0, 3.0], 8);
        assert_eq!(hits.len(), 1);

        // A box straddling the shared edge hits both.
        let hits = cache.query_tiles(&[6.0, 0.0, 2.0], &[10.0, 1.0, 6.0], 8);
        assert_eq!(hits.len(), 2);

        // A box far away hits nothing.
        let hits = cache.query_tiles(&[100.0, 0.0, 100.0], &[110.0, 1.0, 110.0], 8);
        assert!(hits.is_empty());
    }

    #[test]
    fn empty_mesh_vacates_the_tile_location() {
        let (mut cache, mut nav) = two_tile_setup();
        assert!(nav.get_tile_at(0, 0, 0).is_some());

        // A box covering the whole first tile clears every cell.
        let ob = cache
            .add_box_obstacle([-1.0, -1.0, -1.0], [8.5, 3.0, 8.5])
            .unwrap();
        drain(&mut cache, &mut nav);

        assert!(nav.get_tile_at(0, 0, 0).is_none());
        assert!(nav.get_tile_at(1, 0, 0).is_some());

        cache.remove_obstacle(ob).unwrap();
        drain(&mut cache, &mut nav);
        assert!(nav.get_tile_at(0, 0, 0).is_some());
    }

    #[test]
    fn update_with_no_work_is_up_to_date() {
        let (mut cache, mut nav) = two_tile_setup();
        assert!(cache.update(0.1, &mut nav).unwrap());
    }
}
