//! End-to-end tests for tile stitching, reference stability and queries.

#[cfg(test)]
mod tests {
    use crate::{
        create_nav_mesh_data, Link, MeshTile, NavMesh, NavMeshCreateParams, NavMeshParams,
        PolyFlags, PolyRef, PolyType, Status, TileData, TileFlags, TileRef, EXT_LINK,
        MESH_NULL_IDX, NULL_LINK, OFFMESH_CON_BIDIR,
    };

    fn collect_links(tile: &MeshTile, poly: usize) -> Vec<Link> {
        let mut out = Vec::new();
        let mut l = tile.polys[poly].first_link;
        while l != NULL_LINK {
            out.push(tile.links[l as usize]);
            l = tile.links[l as usize].next;
        }
        out
    }

    fn poly_ref(tile_ref: TileRef, poly: u32) -> PolyRef {
        PolyRef(tile_ref.base().id() | poly)
    }

    /// One 10x10 square polygon covering the tile at grid (tx, ty).
    fn square_tile_params(tx: i32, ty: i32) -> NavMeshCreateParams {
        let x0 = tx as f32 * 10.0;
        let z0 = ty as f32 * 10.0;
        let mut neis = [MESH_NULL_IDX; 6];
        if tx == 0 {
            neis[1] = EXT_LINK; // east edge, toward (1, 0)
        } else {
            neis[3] = EXT_LINK | 4; // west edge, toward (0, 0)
        }
        NavMeshCreateParams {
            verts: vec![
                x0,
                0.0,
                z0,
                x0 + 10.0,
                0.0,
                z0,
                x0 + 10.0,
                0.0,
                z0 + 10.0,
                x0,
                0.0,
                z0 + 10.0,
            ],
            vert_count: 4,
            polys: vec![
                0, 1, 2, 3, MESH_NULL_IDX, MESH_NULL_IDX, //
                neis[0], neis[1], neis[2], neis[3], neis[4], neis[5],
            ],
            poly_flags: vec![PolyFlags::WALK.bits()],
            poly_areas: vec![0],
            poly_count: 1,
            nvp: 6,
            tile_x: tx,
            tile_y: ty,
            tile_layer: 0,
            bmin: [x0, 0.0, z0],
            bmax: [x0 + 10.0, 2.0, z0 + 10.0],
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.5,
            cs: 0.3,
            ch: 0.2,
            ..Default::default()
        }
    }

    fn two_tile_mesh() -> (NavMesh, TileRef, TileRef) {
        let params = NavMeshParams {
            orig: [0.0, 0.0, 0.0],
            tile_width: 10.0,
            tile_height: 10.0,
            max_tiles: 4,
            max_polys: 8,
        };
        let mut mesh = NavMesh::new(&params).unwrap();
        let da = create_nav_mesh_data(&square_tile_params(0, 0)).unwrap();
        let db = create_nav_mesh_data(&square_tile_params(1, 0)).unwrap();
        let ra = mesh.add_tile(da, TileFlags::empty(), TileRef::NULL).unwrap();
        let rb = mesh.add_tile(db, TileFlags::empty(), TileRef::NULL).unwrap();
        (mesh, ra, rb)
    }

    // Solo tile, two triangles split along the diagonal.
    #[test]
    fn solo_tile_internal_links() {
        let data = create_nav_mesh_data(&NavMeshCreateParams {
            verts: vec![
                0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 10.0, 0.0, 10.0, 0.0, 0.0, 10.0,
            ],
            vert_count: 4,
            polys: vec![
                // Triangle A: 0-1-2, shares edge (2,0) with B.
                0, 1, 2, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                MESH_NULL_IDX, MESH_NULL_IDX, 1, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX,
                // Triangle B: 0-2-3, shares edge (0,2) with A.
                0, 2, 3, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                0, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX,
            ],
            poly_flags: vec![PolyFlags::WALK.bits(); 2],
            poly_areas: vec![0; 2],
            poly_count: 2,
            nvp: 6,
            bmin: [0.0, 0.0, 0.0],
            bmax: [10.0, 2.0, 10.0],
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.5,
            cs: 0.3,
            ch: 0.2,
            ..Default::default()
        })
        .unwrap();

        let (mesh, tile_ref) = NavMesh::single_tile(data, TileFlags::FREE_DATA).unwrap();

        // The base ref decodes with poly index zero.
        let (_, _, ip) = mesh.decode_poly_ref(tile_ref.base());
        assert_eq!(ip, 0);

        let tile = mesh.get_tile_by_ref(tile_ref).unwrap();

        // One internal link per polygon, on the shared edge.
        let la = collect_links(tile, 0);
        assert_eq!(la.len(), 1);
        assert_eq!(la[0].edge, 2);
        assert_eq!(la[0].side, 0xff);
        assert_eq!(la[0].target, poly_ref(tile_ref, 1));

        let lb = collect_links(tile, 1);
        assert_eq!(lb.len(), 1);
        assert_eq!(lb[0].edge, 0);
        assert_eq!(lb[0].target, poly_ref(tile_ref, 0));

        // Nearest polygon at each centroid is the enclosing polygon.
        let ext = [2.0, 4.0, 2.0];
        let (r, _) = mesh
            .find_nearest_poly_in_tile(tile_ref, &[6.5, 0.0, 3.4], &ext)
            .unwrap();
        assert_eq!(r, poly_ref(tile_ref, 0));
        let (r, _) = mesh
            .find_nearest_poly_in_tile(tile_ref, &[3.4, 0.0, 6.5], &ext)
            .unwrap();
        assert_eq!(r, poly_ref(tile_ref, 1));
    }

    // Two tiles joined along a portal edge.
    #[test]
    fn two_tile_stitching() {
        let (mesh, ra, rb) = two_tile_mesh();

        let ta = mesh.get_tile_by_ref(ra).unwrap();
        let links = collect_links(ta, 0);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].side, 0);
        assert_eq!(links[0].edge, 1);
        assert_eq!(links[0].bmin, 0);
        assert_eq!(links[0].bmax, 255);
        assert_eq!(links[0].target, poly_ref(rb, 0));

        let tb = mesh.get_tile_by_ref(rb).unwrap();
        let links = collect_links(tb, 0);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].side, 4);
        assert_eq!(links[0].edge, 3);
        assert_eq!(links[0].bmin, 0);
        assert_eq!(links[0].bmax, 255);
        assert_eq!(links[0].target, poly_ref(ra, 0));
    }

    // Remove a tile, verify unlinking, re-add it under its old ref.
    #[test]
    fn remove_and_restore_tile() {
        let (mut mesh, ra, rb) = two_tile_mesh();
        let old_poly = poly_ref(ra, 0);
        assert!(mesh.is_valid_poly_ref(old_poly));

        let (_, a_index, _) = mesh.decode_poly_ref(ra.base());
        let data = mesh.remove_tile(ra).unwrap().expect("caller-owned payload");

        // No remaining link targets the removed slot.
        let tb = mesh.get_tile_by_ref(rb).unwrap();
        for i in 0..tb.polys.len() {
            for link in collect_links(tb, i) {
                let (_, it, _) = mesh.decode_poly_ref(link.target);
                assert_ne!(it, a_index);
            }
        }
        assert!(!mesh.is_valid_poly_ref(old_poly));

        // Restoring under the prior ref revives the prior PolyRefs.
        let restored = mesh.add_tile(data, TileFlags::empty(), ra).unwrap();
        assert_eq!(restored, ra);
        assert!(mesh.is_valid_poly_ref(old_poly));

        let ta = mesh.get_tile_by_ref(ra).unwrap();
        let links = collect_links(ta, 0);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, poly_ref(rb, 0));
    }

    // Bidirectional off-mesh connection inside a solo tile.
    #[test]
    fn off_mesh_bidirectional_links() {
        let mut params = square_tile_params(0, 0);
        params.polys[7] = MESH_NULL_IDX; // no portal edges on a solo tile
        params.off_mesh_con_verts = vec![2.0, 0.0, 2.0, 7.0, 0.0, 7.0];
        params.off_mesh_con_rad = vec![1.0];
        params.off_mesh_con_dir = vec![OFFMESH_CON_BIDIR];
        params.off_mesh_con_areas = vec![0];
        params.off_mesh_con_flags = vec![PolyFlags::JUMP.bits()];
        params.off_mesh_con_user_id = vec![1];
        params.off_mesh_con_count = 1;

        let data = create_nav_mesh_data(&params).unwrap();
        let (mesh, tile_ref) = NavMesh::single_tile(data, TileFlags::FREE_DATA).unwrap();
        let tile = mesh.get_tile_by_ref(tile_ref).unwrap();

        assert_eq!(tile.polys[1].poly_type, PolyType::OffMeshConnection);

        // The connection polygon links to the ground polygon from both of
        // its endpoints.
        let om_links = collect_links(tile, 1);
        assert_eq!(om_links.len(), 2);
        for link in &om_links {
            assert_eq!(link.side, 0xff);
            assert_eq!(link.target, poly_ref(tile_ref, 0));
        }
        let mut edges: Vec<u8> = om_links.iter().map(|l| l.edge).collect();
        edges.sort_unstable();
        assert_eq!(edges, vec![0, 1]);

        // Every return link on the ground polygon uses the off-mesh edge
        // marker and targets the connection polygon.
        let ground_links: Vec<Link> = collect_links(tile, 0)
            .into_iter()
            .filter(|l| l.target == poly_ref(tile_ref, 1))
            .collect();
        assert!(!ground_links.is_empty());
        for link in &ground_links {
            assert_eq!(link.edge, 0xff);
            assert_eq!(link.side, 0xff);
        }

        // Both endpoint vertices were snapped onto the ground polygon.
        let om = &tile.polys[1];
        let v0 = om.verts[0] as usize;
        let v1 = om.verts[1] as usize;
        assert!((tile.verts[v0 * 3] - 2.0).abs() < 0.01);
        assert!((tile.verts[v1 * 3] - 7.0).abs() < 0.01);
    }

    // BVH and linear queries agree.
    #[test]
    fn bvh_matches_linear_query() {
        let mut with_bvh = square_tile_params(0, 0);
        with_bvh.polys[7] = MESH_NULL_IDX;
        // Split into two triangles to give the query something to cull.
        with_bvh.polys = vec![
            0, 1, 2, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
            MESH_NULL_IDX, MESH_NULL_IDX, 1, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
            0, 2, 3, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
            0, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX,
        ];
        with_bvh.poly_flags = vec![PolyFlags::WALK.bits(); 2];
        with_bvh.poly_areas = vec![0; 2];
        with_bvh.poly_count = 2;
        let mut without_bvh = with_bvh.clone();
        with_bvh.build_bv_tree = true;
        without_bvh.build_bv_tree = false;

        let (mesh_a, ref_a) =
            NavMesh::single_tile(create_nav_mesh_data(&with_bvh).unwrap(), TileFlags::FREE_DATA)
                .unwrap();
        let (mesh_b, ref_b) = NavMesh::single_tile(
            create_nav_mesh_data(&without_bvh).unwrap(),
            TileFlags::FREE_DATA,
        )
        .unwrap();
        assert!(!mesh_a.get_tile_by_ref(ref_a).unwrap().bv_tree.is_empty());
        assert!(mesh_b.get_tile_by_ref(ref_b).unwrap().bv_tree.is_empty());

        for (qmin, qmax) in [
            ([0.0, -1.0, 0.0], [10.0, 1.0, 10.0]),
            ([6.0, -1.0, 1.0], [9.0, 1.0, 3.0]),
            ([1.0, -1.0, 6.0], [3.0, 1.0, 9.0]),
            ([4.0, -1.0, 4.0], [6.0, 1.0, 6.0]),
        ] {
            let mut a: Vec<u32> = mesh_a
                .query_polygons_in_tile(ref_a, &qmin, &qmax, 16)
                .iter()
                .map(|r| mesh_a.decode_poly_ref(*r).2)
                .collect();
            let mut b: Vec<u32> = mesh_b
                .query_polygons_in_tile(ref_b, &qmin, &qmax, 16)
                .iter()
                .map(|r| mesh_b.decode_poly_ref(*r).2)
                .collect();
            a.sort_unstable();
            b.sort_unstable();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn add_tile_rejects_poly_count_over_capacity() {
        let params = NavMeshParams {
            orig: [0.0, 0.0, 0.0],
            tile_width: 10.0,
            tile_height: 10.0,
            max_tiles: 2,
            max_polys: 2,
        };
        let mut mesh = NavMesh::new(&params).unwrap();

        // Three triangles exceed the two-polygon capacity.
        let data = create_nav_mesh_data(&NavMeshCreateParams {
            verts: vec![
                0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 10.0, 0.0, 10.0, 0.0, 0.0, 10.0, 5.0, 0.0, 5.0,
            ],
            vert_count: 5,
            polys: vec![
                0, 1, 4, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX,
                MESH_NULL_IDX, //
                1, 2, 4, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX,
                MESH_NULL_IDX, //
                2, 3, 4, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX,
                MESH_NULL_IDX,
            ],
            poly_flags: vec![PolyFlags::WALK.bits(); 3],
            poly_areas: vec![0; 3],
            poly_count: 3,
            nvp: 6,
            bmin: [0.0, 0.0, 0.0],
            bmax: [10.0, 2.0, 10.0],
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.5,
            cs: 0.3,
            ch: 0.2,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            mesh.add_tile(data, TileFlags::empty(), TileRef::NULL).err(),
            Some(Status::InvalidParam)
        );
    }

    #[test]
    fn add_tile_rejects_bad_magic_version_and_occupancy() {
        let params = NavMeshParams {
            orig: [0.0, 0.0, 0.0],
            tile_width: 10.0,
            tile_height: 10.0,
            max_tiles: 4,
            max_polys: 8,
        };
        let mut mesh = NavMesh::new(&params).unwrap();
        let mut tile_params = square_tile_params(0, 0);
        tile_params.polys[7] = MESH_NULL_IDX;
        let data = create_nav_mesh_data(&tile_params).unwrap();

        let mut bad = data.clone();
        bad[0] ^= 0xff;
        assert_eq!(
            mesh.add_tile(bad, TileFlags::empty(), TileRef::NULL).err(),
            Some(Status::WrongMagic)
        );

        let mut bad = data.clone();
        bad[4] = 0x7f;
        assert_eq!(
            mesh.add_tile(bad, TileFlags::empty(), TileRef::NULL).err(),
            Some(Status::WrongVersion)
        );

        mesh.add_tile(data.clone(), TileFlags::empty(), TileRef::NULL)
            .unwrap();
        assert_eq!(
            mesh.add_tile(data, TileFlags::empty(), TileRef::NULL).err(),
            Some(Status::AlreadyOccupied)
        );
    }

    #[test]
    fn salt_bumps_on_remove_and_never_zero() {
        let (mut mesh, ra, _) = two_tile_mesh();
        let (salt0, it, _) = mesh.decode_poly_ref(ra.base());
        assert_ne!(salt0, 0);

        let data = mesh.remove_tile(ra).unwrap().unwrap();
        let rb = mesh.add_tile(data, TileFlags::empty(), TileRef::NULL).unwrap();
        let (salt1, it1, _) = mesh.decode_poly_ref(rb.base());

        // Same slot, newer generation; the stale ref no longer resolves.
        assert_eq!(it, it1);
        assert_eq!(salt1, salt0 + 1);
        assert!(!mesh.is_valid_poly_ref(ra.base()));
        assert!(mesh.is_valid_poly_ref(rb.base()));
    }

    #[test]
    fn poly_ref_validation_round_trip() {
        let (mesh, ra, rb) = two_tile_mesh();
        for tile_ref in [ra, rb] {
            let r = poly_ref(tile_ref, 0);
            assert!(mesh.is_valid_poly_ref(r));
            let (tile, poly) = mesh.get_tile_and_poly_by_ref(r).unwrap();
            let (tile2, poly2) = mesh.get_tile_and_poly_by_ref_unchecked(r);
            assert_eq!(tile.header.as_ref().unwrap().x, tile2.header.as_ref().unwrap().x);
            assert_eq!(poly.vert_count, poly2.vert_count);
        }
        // Garbage polygon index fails validation.
        assert!(!mesh.is_valid_poly_ref(poly_ref(ra, 7)));
        assert!(!mesh.is_valid_poly_ref(PolyRef::NULL));
    }

    #[test]
    fn tile_state_round_trip_and_ref_guard() {
        let (mut mesh, ra, _) = two_tile_mesh();
        let p = poly_ref(ra, 0);

        mesh.set_poly_flags(p, PolyFlags::WALK | PolyFlags::DOOR).unwrap();
        mesh.set_poly_area(p, 7).unwrap();
        let state = mesh.store_tile_state(ra).unwrap();

        mesh.set_poly_flags(p, PolyFlags::DISABLED).unwrap();
        mesh.set_poly_area(p, 1).unwrap();

        mesh.restore_tile_state(ra, &state).unwrap();
        assert_eq!(mesh.get_poly_flags(p).unwrap(), PolyFlags::WALK | PolyFlags::DOOR);
        assert_eq!(mesh.get_poly_area(p).unwrap(), 7);

        // Once the tile ref changes, the snapshot no longer applies.
        let data = mesh.remove_tile(ra).unwrap().unwrap();
        let rnew = mesh.add_tile(data, TileFlags::empty(), TileRef::NULL).unwrap();
        assert_ne!(rnew, ra);
        assert_eq!(mesh.restore_tile_state(ra, &state).err(), Some(Status::InvalidParam));
        assert_eq!(mesh.restore_tile_state(rnew, &state).err(), Some(Status::InvalidParam));
    }

    #[test]
    fn link_pool_exhaustion_drops_links_without_corruption() {
        // Hand-build a payload whose link pool holds a single record even
        // though both polygons want one.
        let mut data = create_nav_mesh_data(&NavMeshCreateParams {
            verts: vec![
                0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 10.0, 0.0, 10.0, 0.0, 0.0, 10.0,
            ],
            vert_count: 4,
            polys: vec![
                0, 1, 2, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                MESH_NULL_IDX, MESH_NULL_IDX, 1, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                0, 2, 3, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, //
                0, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX,
            ],
            poly_flags: vec![PolyFlags::WALK.bits(); 2],
            poly_areas: vec![0; 2],
            poly_count: 2,
            nvp: 6,
            bmin: [0.0, 0.0, 0.0],
            bmax: [10.0, 2.0, 10.0],
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.5,
            cs: 0.3,
            ch: 0.2,
            ..Default::default()
        })
        .unwrap();

        let mut tile = TileData::from_bytes(&data).unwrap();
        tile.header.max_link_count = 1;
        tile.links.truncate(1);
        data = tile.to_bytes();

        let (mesh, tile_ref) = NavMesh::single_tile(data, TileFlags::FREE_DATA).unwrap();
        let tile = mesh.get_tile_by_ref(tile_ref).unwrap();
        let total = collect_links(tile, 0).len() + collect_links(tile, 1).len();
        assert_eq!(total, 1);
    }

    #[test]
    fn calc_tile_loc_floors_into_grid() {
        let (mesh, _, _) = two_tile_mesh();
        assert_eq!(mesh.calc_tile_loc(glam::Vec3::new(5.0, 0.0, 5.0)), (0, 0));
        assert_eq!(mesh.calc_tile_loc(glam::Vec3::new(15.0, 0.0, 5.0)), (1, 0));
        assert_eq!(mesh.calc_tile_loc(glam::Vec3::new(-0.1, 0.0, 5.0)), (-1, 0));
    }
}
