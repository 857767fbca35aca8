//! Cache behaviour with a mechanism reducer attached.

use isat::{IsatCache, IsatConfig, LinearChemistry, StaticReducer};
use nalgebra::{DMatrix, DVector};

/// 3-species mechanism (composition space of 5) with the third species
/// inactive: leaves tabulate in a 4-dimensional working space.
fn reduced_cache() -> IsatCache<LinearChemistry> {
    let n = 5;
    let m = DMatrix::from_diagonal(&DVector::from_element(n, 0.1));
    let solver = LinearChemistry::new(m, DVector::zeros(n));
    let config = IsatConfig::new(3, 1e-3, 16);
    IsatCache::new(config, solver)
        .unwrap()
        .with_reducer(Box::new(StaticReducer::new(vec![true, true, false])))
}

#[test]
fn test_leaves_tabulate_in_the_reduced_subspace() {
    let mut cache = reduced_cache();
    cache.query_vector(&DVector::zeros(5)).unwrap();

    let (_, leaf) = cache.tree().iter().next().unwrap();
    assert_eq!(leaf.dim(), 4, "two active species plus T and p");
    assert_eq!(leaf.n_eq(), 5);
    assert_eq!(leaf.lt().nrows(), 4);
    let red = leaf.reduction().expect("leaf must carry its reduction");
    assert_eq!(red.n_active(), 2);
}

#[test]
fn test_inactive_coordinate_is_invisible_to_retrieval() {
    let mut cache = reduced_cache();
    cache.query_vector(&DVector::zeros(5)).unwrap();

    // Any excursion of the inactive species alone must still retrieve.
    let mut phi_q = DVector::zeros(5);
    phi_q[2] = 7.5;
    cache.query_vector(&phi_q).unwrap();
    let stats = cache.stats();
    assert_eq!(stats.tot_retrieve, 1);
    assert_eq!(stats.size, 1);

    // The same excursion in an active species misses.
    let mut phi_q = DVector::zeros(5);
    phi_q[0] = 7.5;
    cache.query_vector(&phi_q).unwrap();
    assert_eq!(cache.stats().tot_retrieve, 1, "active excursion cannot retrieve");
}

#[test]
fn test_grow_updates_the_active_block() {
    let mut cache = reduced_cache();
    cache.query_vector(&DVector::zeros(5)).unwrap();

    // Outside the 0.01 ellipsoid in an active direction; the mapping is
    // affine over the active block, so the solution check passes and
    // the reduced-space ellipsoid grows.
    let mut phi_g = DVector::zeros(5);
    phi_g[0] = 0.05;
    cache.query_vector(&phi_g).unwrap();
    let stats = cache.stats();
    assert_eq!(stats.n_grow, 1);
    assert_eq!(stats.size, 1);

    let (_, leaf) = cache.tree().iter().next().unwrap();
    assert_eq!(leaf.lt().nrows(), 4, "the factor must stay in the reduced space");
    assert_eq!(leaf.n_grown(), 1);
    assert!(leaf.in_eoa(&phi_g));

    // Growing in the active block must not wake the inactive one.
    let mut far_inactive = DVector::zeros(5);
    far_inactive[2] = 123.0;
    assert!(leaf.in_eoa(&far_inactive));
}

#[test]
fn test_inactive_species_pass_through_interpolation() {
    let mut cache = reduced_cache();
    cache.query_vector(&DVector::zeros(5)).unwrap();

    let mut phi_q = DVector::zeros(5);
    phi_q[2] = 0.4;
    let result = cache.query_vector(&phi_q).unwrap();
    assert_eq!(cache.stats().tot_retrieve, 1);

    // The reducer declared species 2 unreacting, so its value survives
    // the mapping unchanged; active components follow the tabulated
    // linear model.
    assert!((result[2] - 0.4).abs() < 1e-12);
    assert!(result[0].abs() < 1e-12);
    assert!(result[1].abs() < 1e-12);
}

#[test]
fn test_temperature_and_pressure_always_active() {
    let mut cache = reduced_cache();
    cache.query_vector(&DVector::zeros(5)).unwrap();

    // Temperature excursion beyond the ellipsoid must miss even though
    // species reduction is on.
    let mut phi_q = DVector::zeros(5);
    phi_q[3] = 7.5;
    cache.query_vector(&phi_q).unwrap();
    let stats = cache.stats();
    assert_eq!(stats.tot_retrieve, 0);
    assert_eq!(stats.n_grow + stats.n_add, 2);
}
