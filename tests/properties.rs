use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Point3, Vector3};
use pcg_rand::Pcg32;
use rand::{Rng, SeedableRng};

use pi_dense_octree::{
    box_center_from_index, AabbQuery, ExplicitFreeSpaceLeaf, FrustumQuery, LeafPayload, Octree,
    OccupiedOnlyLeaf, Query, TraverseBoxInsertPolicy, TraverseSegmentInsertPolicy, VoxelKey,
    ROOT_KEY,
};

type FreeSpaceTree = Octree<f64, ExplicitFreeSpaceLeaf<f64>, TraverseSegmentInsertPolicy>;
type OccupiedTree = Octree<f64, OccupiedOnlyLeaf<f64>, TraverseBoxInsertPolicy>;

const HALF: f64 = 10.0;
const DEPTH: u32 = 5;

fn random_point(rng: &mut Pcg32, half: f64) -> Point3<f64> {
    Point3::new(
        rng.gen_range(-half..half),
        rng.gen_range(-half..half),
        rng.gen_range(-half..half),
    )
}

// 起点在空间外，终点在空间内
fn random_rays(rng: &mut Pcg32, n: usize) -> Vec<(Point3<f64>, Point3<f64>)> {
    (0..n)
        .map(|_| {
            let source = Point3::new(0.0, 0.0, HALF * 1.5) + random_point(rng, 2.0).coords;
            (source, random_point(rng, HALF * 0.95))
        })
        .collect()
}

fn build<L: LeafPayload<f64>, P: pi_dense_octree::InsertPolicy<f64>>(
    rays: &[(Point3<f64>, Point3<f64>)],
) -> Octree<f64, L, P> {
    let mut tree = Octree::new(HALF, DEPTH).unwrap();
    for (s, t) in rays {
        tree.insert(s, t);
    }
    tree
}

fn leaf_map(tree: &FreeSpaceTree) -> BTreeMap<VoxelKey, ExplicitFreeSpaceLeaf<f64>> {
    tree.leaves()
        .iter()
        .map(|l| (l.sort_key(), l.clone()))
        .collect()
}

fn query_keys<Q: Query<f64>>(tree: &FreeSpaceTree, q: &Q) -> BTreeSet<VoxelKey> {
    let mut keys = BTreeSet::new();
    tree.query(q, |leaf, _, _| {
        keys.insert(leaf.sort_key());
    });
    keys
}

fn interior_keys(tree: &FreeSpaceTree) -> BTreeSet<VoxelKey> {
    let mut keys = BTreeSet::new();
    for leaf in tree.leaves() {
        let mut k = leaf.sort_key();
        while k != ROOT_KEY {
            k >>= 4;
            keys.insert(k);
        }
    }
    keys
}

#[test]
fn merge_is_commutative() {
    let mut rng = Pcg32::seed_from_u64(1111);
    for _ in 0..10 {
        let a: FreeSpaceTree = build(&random_rays(&mut rng, 30));
        let b: FreeSpaceTree = build(&random_rays(&mut rng, 30));
        let ab = a.merge(&b).unwrap();
        let ba = b.merge(&a).unwrap();
        assert_eq!(ab.leaves(), ba.leaves());
        for k in interior_keys(&ab) {
            assert_eq!(ab.occupancy(k), ba.occupancy(k));
        }
    }
}

#[test]
fn merge_matches_single_tree() {
    let mut rng = Pcg32::seed_from_u64(2222);
    for _ in 0..10 {
        let first = random_rays(&mut rng, 25);
        let second = random_rays(&mut rng, 25);
        let a: FreeSpaceTree = build(&first);
        let b: FreeSpaceTree = build(&second);
        let all: Vec<_> = first.iter().chain(second.iter()).cloned().collect();
        let whole: FreeSpaceTree = build(&all);
        let merged = a.merge(&b).unwrap();

        let m = leaf_map(&merged);
        let w = leaf_map(&whole);
        assert_eq!(m.keys().collect::<Vec<_>>(), w.keys().collect::<Vec<_>>());
        for (k, x) in m.iter() {
            let y = &w[k];
            assert_eq!(x.occupied_count(), y.occupied_count());
            assert_eq!(x.empty_count, y.empty_count);
            assert!((x.centroid() - y.centroid()).norm() <= 1e-9);
            let (mx, my) = (x.moments.second_moments(), y.moments.second_moments());
            let scale = my.trace().max(1.0);
            for (a, b) in mx.iter().zip(my.iter()) {
                assert!((a - b).abs() <= 50.0 * f64::EPSILON * scale, "{} vs {}", a, b);
            }
            assert!((x.mean_view_direction() - y.mean_view_direction()).norm() <= 1e-12);
        }
        for k in interior_keys(&whole) {
            assert_eq!(merged.occupancy(k), whole.occupancy(k));
        }
    }
}

#[test]
fn query_commutes_with_merge() {
    let mut rng = Pcg32::seed_from_u64(3333);
    for _ in 0..10 {
        let a: FreeSpaceTree = build(&random_rays(&mut rng, 20));
        let b: FreeSpaceTree = build(&random_rays(&mut rng, 20));
        let merged = a.merge(&b).unwrap();

        let center = random_point(&mut rng, HALF);
        let half = Vector3::new(
            rng.gen_range(0.5..HALF),
            rng.gen_range(0.5..HALF),
            rng.gen_range(0.5..HALF),
        );
        let q = AabbQuery::new(center, half);
        let union: BTreeSet<_> = query_keys(&a, &q).union(&query_keys(&b, &q)).cloned().collect();
        assert_eq!(query_keys(&merged, &q), union);

        let f = FrustumQuery::new(
            Point3::new(0.0, 0.0, -HALF * 2.0),
            &Vector3::new(rng.gen_range(-0.3..0.3), rng.gen_range(-0.3..0.3), 0.0),
            0.3,
            0.2,
        );
        let union: BTreeSet<_> = query_keys(&a, &f).union(&query_keys(&b, &f)).cloned().collect();
        assert_eq!(query_keys(&merged, &f), union);
    }
}

#[test]
fn duplicate_insert_doubles_counts() {
    let mut rng = Pcg32::seed_from_u64(4444);
    for _ in 0..20 {
        let rays = random_rays(&mut rng, 1);
        let (s, t) = rays[0];
        let mut once: FreeSpaceTree = Octree::new(HALF, DEPTH).unwrap();
        let mut twice: FreeSpaceTree = Octree::new(HALF, DEPTH).unwrap();
        let visited = once.insert(&s, &t);
        assert_eq!(twice.insert(&s, &t), visited);
        assert_eq!(twice.insert(&s, &t), visited);

        let a = leaf_map(&once);
        let b = leaf_map(&twice);
        assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
        for (k, x) in a.iter() {
            let y = &b[k];
            assert_eq!(y.occupied_count(), x.occupied_count() * 2);
            assert_eq!(y.empty_count, x.empty_count * 2);
        }
    }
}

#[test]
fn key_center_round_trip() {
    let mut rng = Pcg32::seed_from_u64(5555);
    for depth in [0u32, 1, 4, 9, 16] {
        let tree = OccupiedTree::new(HALF, depth).unwrap();
        let voxel_half = tree.voxel_half_extent();
        for _ in 0..200 {
            let p = random_point(&mut rng, HALF);
            let key = tree.key_at(&p).unwrap();
            let c = box_center_from_index(key, HALF).unwrap();
            let d = p - c;
            assert!(d.x.abs() <= voxel_half, "depth {} key {:x}", depth, key);
            assert!(d.y.abs() <= voxel_half);
            assert!(d.z.abs() <= voxel_half);
        }
    }

    // 遍历时传入的中心与键解码一致
    let tree: OccupiedTree = build(&random_rays(&mut rng, 50));
    tree.visit_all_leaves(|leaf, center, half| {
        assert_eq!(tree.voxel_center(leaf.sort_key()).unwrap(), *center);
        assert_eq!(half, tree.voxel_half_extent());
    });
}

#[test]
fn parallel_moment_merge() {
    let mut rng = Pcg32::seed_from_u64(6666);
    for _ in 0..20 {
        let n = rng.gen_range(2..60);
        let split = rng.gen_range(1..n);
        let offset = random_point(&mut rng, 1.0).coords;
        let points: Vec<_> = (0..n).map(|_| random_point(&mut rng, 1.0) + offset).collect();

        let accumulate = |points: &[Point3<f64>]| {
            let mut leaf: OccupiedOnlyLeaf<f64> = OccupiedOnlyLeaf::default();
            for p in points {
                leaf.update(&Point3::origin(), HALF, &Point3::origin(), p);
            }
            leaf
        };
        let whole = accumulate(&points);
        let merged = OccupiedOnlyLeaf::merge(&accumulate(&points[..split]), &accumulate(&points[split..]));
        assert_eq!(merged.occupied_count(), n as u64);

        let m = merged.moments.second_moments();
        let w = whole.moments.second_moments();
        let scale = w.trace();
        for (x, y) in m.iter().zip(w.iter()) {
            assert!((x - y).abs() <= 50.0 * f64::EPSILON * scale, "{} vs {}", x, y);
        }
        assert!((merged.centroid() - whole.centroid()).norm() <= 1e-9 * offset.norm().max(1.0));
    }
}

#[test]
fn single_precision_tree() {
    let mut rng = Pcg32::seed_from_u64(7777);
    let mut tree: Octree<f32, ExplicitFreeSpaceLeaf<f32>, TraverseSegmentInsertPolicy> =
        Octree::new(8.0, 6).unwrap();
    let mut occupied = 0;
    for _ in 0..50 {
        let t = Point3::new(
            rng.gen_range(-7.0f32..7.0),
            rng.gen_range(-7.0f32..7.0),
            rng.gen_range(-7.0f32..7.0),
        );
        tree.insert(&Point3::new(0.0, 0.0, 12.0), &t);
        occupied += 1;
    }
    let mut hits = 0;
    tree.visit_all_leaves(|leaf, _, _| hits += leaf.occupied_count());
    // 终点落在体素边界上时会计入多个叶节点
    assert!(hits >= occupied);
    let merged = tree.merge(&tree).unwrap();
    assert_eq!(merged.len(), tree.len());
}
