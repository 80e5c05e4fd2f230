//! Grid denoising with Potts smoothing factors.
//!
//! An 8x8 image over 256 grey levels gets a Gaussian unary per pixel and a
//! Potts factor per neighbouring pair. A handful of pixels carry heavy
//! noise; smoothing must pull them back towards their patch level without
//! disturbing the flat regions.

use factorbp::{BpAlgo, BpGraph, BpParams, PottsNodes, PottsParams, Role, VarNodes, VarParams};
use ndarray::Array2;

const SIDE: usize = 8;
const NUM_STATES: usize = 256;

/// Gaussian evidence around the observed grey level, variance 1/256 in
/// normalised intensity.
fn observation_rows(levels: &[usize]) -> Array2<f64> {
    let sig2 = 1.0 / NUM_STATES as f64;
    let mut rows = Array2::zeros((levels.len(), NUM_STATES));
    for (r, &level) in levels.iter().enumerate() {
        let x = level as f64 / (NUM_STATES - 1) as f64;
        for s in 0..NUM_STATES {
            let v = s as f64 / (NUM_STATES - 1) as f64;
            rows[[r, s]] = (-(x - v) * (x - v) / sig2).exp();
        }
    }
    rows
}

#[test]
fn potts_smoothing_repairs_noisy_pixels_and_keeps_flat_regions() {
    // two flat halves with four heavily corrupted interior pixels
    let noisy_pixels: [(usize, usize, usize); 4] =
        [(1, 1, 140), (2, 5, 65), (5, 2, 225), (6, 6, 140)];
    let patch_level = |r: usize| if r < 4 { 100 } else { 180 };

    let mut observed = vec![0usize; SIDE * SIDE];
    for r in 0..SIDE {
        for c in 0..SIDE {
            observed[r * SIDE + c] = patch_level(r);
        }
    }
    for &(r, c, level) in noisy_pixels.iter() {
        observed[r * SIDE + c] = level;
    }

    let mut graph = BpGraph::new(BpParams {
        damp: 0.25,
        iters: 300,
        seed: 8,
        ..Default::default()
    });
    let vars = graph.add_var_nodes(VarNodes::new(
        "pixels",
        VarParams { num_states: NUM_STATES, ..Default::default() },
    ));
    let ids = graph.var_nodes_mut(vars).create_nodes(SIDE * SIDE);
    let obs = observation_rows(&observed);
    graph.var_nodes_mut(vars).add_unaries(&ids, obs.view());

    let potts = graph.add_factor_nodes(PottsNodes::new(
        "smooth",
        PottsParams { alpha: 1e-3, bp_algo: BpAlgo::Sum },
    ));
    for r in 0..SIDE {
        for c in 0..SIDE {
            if c + 1 < SIDE {
                let fact = graph.factor_nodes_mut(potts).create_nodes(1)[0];
                graph.add_edge(vars, ids[r * SIDE + c], potts, fact, Role::Default);
                graph.add_edge(vars, ids[r * SIDE + c + 1], potts, fact, Role::Default);
            }
            if r + 1 < SIDE {
                let fact = graph.factor_nodes_mut(potts).create_nodes(1)[0];
                graph.add_edge(vars, ids[r * SIDE + c], potts, fact, Role::Default);
                graph.add_edge(vars, ids[(r + 1) * SIDE + c], potts, fact, Role::Default);
            }
        }
    }

    graph.add_nodes_to_schedule(vars);
    graph.add_nodes_to_schedule(potts);
    graph.finalize();
    graph.do_message_passing();

    let denoised = graph.var_nodes(vars).map_states();
    let is_noisy =
        |r: usize, c: usize| noisy_pixels.iter().any(|&(nr, nc, _)| nr == r && nc == c);

    for r in 0..SIDE {
        for c in 0..SIDE {
            let level = denoised[r * SIDE + c] as i64;
            let patch = patch_level(r) as i64;
            if is_noisy(r, c) {
                // pulled back to the surrounding patch
                let observed_err = (observed[r * SIDE + c] as i64 - patch).abs();
                assert!(
                    (level - patch).abs() <= 5,
                    "noisy pixel ({}, {}) denoised to {} but its patch is {}",
                    r,
                    c,
                    level,
                    patch
                );
                assert!((level - patch).abs() < observed_err);
            } else {
                // flat regions barely move
                assert!(
                    (level - patch).abs() <= 3,
                    "flat pixel ({}, {}) drifted from {} to {}",
                    r,
                    c,
                    patch,
                    level
                );
            }
        }
    }

    // beliefs stay normalised across all 256 states
    let bel = graph.beliefs(vars);
    for n in 0..SIDE * SIDE {
        let tot: f64 = (0..NUM_STATES).map(|s| bel[[s, n]]).sum();
        assert!((tot - 1.0).abs() < 1e-6);
    }
}
