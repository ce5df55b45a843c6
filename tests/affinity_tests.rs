use procpool::affinity::AffinityMap;

#[test]
fn disabled_map_skips_pinning() {
    let map = AffinityMap::new(None, 2, 2, true);
    assert!(!map.is_enabled());
    assert_eq!(map.cpu_for_slot(0), None);
    assert_eq!(map.cpu_for_slot(7), None);
}

#[test]
fn identity_on_single_threaded_single_node() {
    let map = AffinityMap::new(Some(1), 1, 1, true);
    for slot in 0..8 {
        assert_eq!(map.cpu_for_slot(slot), Some(slot));
    }
}

#[test]
fn cross_node_enumeration_skips_secondary_threads() {
    // Two nodes, two HW threads per core, CPUs enumerated across nodes:
    // primary threads sit at 0, 1, 4, 5, 8, 9, ...
    let map = AffinityMap::new(Some(1), 2, 2, true);
    assert_eq!(map.cpu_for_slot(0), Some(0));
    assert_eq!(map.cpu_for_slot(1), Some(1));
    assert_eq!(map.cpu_for_slot(2), Some(4));
    assert_eq!(map.cpu_for_slot(3), Some(5));
    assert_eq!(map.cpu_for_slot(4), Some(8));
}

#[test]
fn sequential_enumeration_strides_by_core_threads() {
    let map = AffinityMap::new(Some(1), 2, 1, false);
    assert_eq!(map.cpu_for_slot(0), Some(0));
    assert_eq!(map.cpu_for_slot(1), Some(2));
    assert_eq!(map.cpu_for_slot(2), Some(4));
}

#[test]
fn step_spreads_workers_over_the_table() {
    // Step 2 doubles the distance between consecutive workers, trading
    // worker count for per-worker cache.
    let map = AffinityMap::new(Some(2), 2, 2, true);
    assert_eq!(map.cpu_for_slot(0), Some(0));
    assert_eq!(map.cpu_for_slot(1), Some(4));
    assert_eq!(map.cpu_for_slot(2), Some(8));
}
