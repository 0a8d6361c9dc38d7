//! 插入、合并、查询的性能测试

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::{Point3, Vector3};
use pcg_rand::Pcg32;
use rand::{Rng, SeedableRng};

use pi_dense_octree::{
    AabbQuery, ExplicitFreeSpaceLeaf, FrustumQuery, OccupiedOnlyLeaf, Octree,
    TraverseBoxInsertPolicy, TraverseSegmentInsertPolicy,
};

type FreeSpaceTree = Octree<f32, ExplicitFreeSpaceLeaf<f32>, TraverseSegmentInsertPolicy>;
type OccupiedTree = Octree<f32, OccupiedOnlyLeaf<f32>, TraverseBoxInsertPolicy>;

const HALF: f32 = 32.0;

fn targets(seed: u64, n: usize) -> Vec<Point3<f32>> {
    let mut rng = Pcg32::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Point3::new(
                rng.gen_range(-HALF..HALF),
                rng.gen_range(-HALF..HALF),
                rng.gen_range(-HALF * 0.2..HALF * 0.2),
            )
        })
        .collect()
}

fn free_space_tree(points: &[Point3<f32>], depth: u32) -> FreeSpaceTree {
    let origin = Point3::new(0.0, 0.0, HALF * 0.9);
    let mut tree = Octree::new(HALF, depth).unwrap();
    for p in points {
        tree.insert(&origin, p);
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    let points = targets(1, 1000);
    let origin = Point3::new(0.0, 0.0, HALF * 0.9);
    let mut group = c.benchmark_group("insert");
    for depth in [6u32, 8, 10] {
        group.bench_with_input(BenchmarkId::new("occupied_only", depth), &depth, |b, &depth| {
            b.iter(|| {
                let mut tree = OccupiedTree::new(HALF, depth).unwrap();
                for p in points.iter() {
                    black_box(tree.insert(&origin, p));
                }
                tree
            })
        });
        group.bench_with_input(BenchmarkId::new("free_space", depth), &depth, |b, &depth| {
            b.iter(|| free_space_tree(black_box(&points), depth))
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let a = free_space_tree(&targets(2, 1000), 8);
    let b = free_space_tree(&targets(3, 1000), 8);
    c.bench_function("merge", |bench| bench.iter(|| a.merge(black_box(&b)).unwrap()));
}

fn bench_query(c: &mut Criterion) {
    let tree = free_space_tree(&targets(4, 2000), 8);
    let aabb = AabbQuery::new(Point3::new(4.0, -4.0, 0.0), Vector3::new(8.0, 8.0, 4.0));
    let frustum = FrustumQuery::new(Point3::new(0.0, 0.0, -HALF), &Vector3::zeros(), 0.4, 0.3);
    let mut group = c.benchmark_group("query");
    group.bench_function("aabb", |b| {
        b.iter(|| {
            let mut n = 0u64;
            tree.query(black_box(&aabb), |leaf, _, _| n += leaf.empty_count);
            n
        })
    });
    group.bench_function("frustum", |b| {
        b.iter(|| {
            let mut n = 0u64;
            tree.query(black_box(&frustum), |leaf, _, _| n += leaf.empty_count);
            n
        })
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_merge, bench_query);
criterion_main!(benches);
