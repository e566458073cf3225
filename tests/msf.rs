use diskgraph::apps::msf::{self, MstEdge};
use diskgraph::config::Config;
use diskgraph::preprocessing::Sharder;
use diskgraph::types::VId;
use std::collections::HashSet;

fn shard_weighted(base: &str, edges: &[(VId, VId, f64)], nshards: &str, config: &Config) -> usize {
    let mut sharder: Sharder<MstEdge> = Sharder::new(base, config);
    for &(src, dst, weight) in edges {
        sharder
            .add_edge_with_value(src, dst, MstEdge::with_weight(weight))
            .unwrap();
    }
    sharder.execute_sharding(nshards).unwrap()
}

fn read_mst_edges(base: &str) -> Vec<(VId, VId, f64)> {
    std::fs::read_to_string(format!("{}.mst", base))
        .unwrap()
        .lines()
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            (
                fields[0].parse().unwrap(),
                fields[1].parse().unwrap(),
                fields[2].parse().unwrap(),
            )
        })
        .collect()
}

#[test]
fn test_boruvka_on_weighted_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("cycle").to_string_lossy().into_owned();
    let config = Config::new();
    let edges = [
        (0, 1, 1.0),
        (1, 2, 2.0),
        (2, 3, 3.0),
        (3, 0, 4.0),
    ];
    let nshards = shard_weighted(&base, &edges, "1", &config);

    let total = msf::run(&base, nshards, &config).unwrap();
    assert!((total - 6.0).abs() < 1e-9, "total weight {}", total);

    // The heaviest cycle edge is the one left out.
    let selected: HashSet<(VId, VId)> = read_mst_edges(&base)
        .into_iter()
        .map(|(a, b, _)| (a.min(b), a.max(b)))
        .collect();
    let expected: HashSet<(VId, VId)> = [(0, 1), (1, 2), (2, 3)].iter().cloned().collect();
    assert_eq!(selected, expected);
}

#[test]
fn test_msf_with_contraction_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("path").to_string_lossy().into_owned();
    let config = Config::new();
    // A weighted path: the forest is the whole path. Two shards keep the
    // label propagation short per round, forcing contraction rounds that
    // exercise the sharded output.
    let edges: Vec<(VId, VId, f64)> = (0..12u32).map(|i| (i, i + 1, (i + 1) as f64)).collect();
    let nshards = shard_weighted(&base, &edges, "2", &config);
    assert_eq!(nshards, 2);

    let total = msf::run(&base, nshards, &config).unwrap();
    let expected: f64 = (1..=12).map(f64::from).sum();
    assert!((total - expected).abs() < 1e-9, "total weight {}", total);
}

#[test]
fn test_msf_two_components() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("forest").to_string_lossy().into_owned();
    let config = Config::new();
    // Two triangles; each contributes its two lightest edges.
    let edges = [
        (0, 1, 1.0),
        (1, 2, 5.0),
        (2, 0, 2.0),
        (3, 4, 1.5),
        (4, 5, 2.5),
        (5, 3, 9.0),
    ];
    let nshards = shard_weighted(&base, &edges, "1", &config);

    let total = msf::run(&base, nshards, &config).unwrap();
    assert!((total - 7.0).abs() < 1e-9, "total weight {}", total);
}
