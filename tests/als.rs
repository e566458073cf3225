use diskgraph::apps::als;
use diskgraph::config::Config;
use diskgraph::preprocessing::Sharder;
use diskgraph::types::VId;

#[test]
fn test_als_fits_small_ratings_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ratings").to_string_lossy().into_owned();
    let mut config = Config::new();
    config.set("als.lambda", "0.0000001");
    // Sequential updates keep the smoke test deterministic.
    config.set("execthreads", 1);

    // A rank-one 3x3 ratings matrix: users 0..2, items 3..5.
    let users = [1.0f32, 2.0, 3.0];
    let items = [1.0f32, 0.5, 2.0];
    let mut sharder: Sharder<f32> = Sharder::new(&base, &config);
    for (u, &uw) in users.iter().enumerate() {
        for (m, &mw) in items.iter().enumerate() {
            sharder
                .add_edge_with_value(u as VId, 3 + m as VId, uw * mw)
                .unwrap();
        }
    }
    let nshards = sharder.execute_sharding("1").unwrap();

    let rmse = als::run::<2>(&base, nshards, 20, &config).unwrap();
    assert!(rmse < 0.01, "training rmse {}", rmse);
}
