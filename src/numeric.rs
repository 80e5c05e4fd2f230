//! Dense-tensor helpers shared by the message kernels.

use ndarray::{Array1, Array2, Array3, Axis};

/// Make each column along the state axis (axis 1) of `msgs` sum to 1.0.
pub(crate) fn normalize_states(msgs: &mut Array3<f64>) {
    let sums = msgs.sum_axis(Axis(1)).insert_axis(Axis(1));
    *msgs /= &sums.broadcast(msgs.raw_dim()).unwrap();
}

/// Log-sum-exp along the state axis of a `[D, S, N]` tensor, returned as
/// `[D, 1, N]` so it broadcasts back over the input.
pub(crate) fn log_sum_exp_states(log_msgs: &Array3<f64>) -> Array3<f64> {
    let max = log_msgs
        .fold_axis(Axis(1), f64::NEG_INFINITY, |&m, &x| m.max(x))
        .insert_axis(Axis(1));
    let mut shifted = log_msgs - &max.broadcast(log_msgs.raw_dim()).unwrap();
    shifted.mapv_inplace(f64::exp);
    let mut lse = shifted.sum_axis(Axis(1)).insert_axis(Axis(1));
    lse.mapv_inplace(f64::ln);
    lse + &max
}

/// Log-sum-exp along the state axis (axis 0) of a `[S, N]` table.
pub(crate) fn log_sum_exp_nodes(log_table: &Array2<f64>) -> Array1<f64> {
    let max = log_table.fold_axis(Axis(0), f64::NEG_INFINITY, |&m, &x| m.max(x));
    let max_b = max.view().insert_axis(Axis(0));
    let mut shifted = log_table - &max_b.broadcast(log_table.raw_dim()).unwrap();
    shifted.mapv_inplace(f64::exp);
    let mut lse = shifted.sum_axis(Axis(0));
    lse.mapv_inplace(f64::ln);
    lse + &max
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn normalize_states_unit_columns() {
        let mut m = array![[[2.0, 1.0], [2.0, 3.0]], [[0.5, 4.0], [1.5, 4.0]]];
        normalize_states(&mut m);
        for d in 0..2 {
            for n in 0..2 {
                let tot: f64 = (0..2).map(|s| m[[d, s, n]]).sum();
                assert_abs_diff_eq!(tot, 1.0, epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(m[[0, 0, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(m[[1, 0, 1]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn log_sum_exp_matches_direct_sum() {
        let logs = array![[[0.1f64, -3.0], [-0.5, -2.0], [-1.0, -1.0]]];
        let lse = log_sum_exp_states(&logs);
        for n in 0..2 {
            let direct: f64 = (0..3).map(|s| logs[[0, s, n]].exp()).sum();
            assert_abs_diff_eq!(lse[[0, 0, n]], direct.ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn log_sum_exp_nodes_is_stable_for_large_magnitudes() {
        let logs = array![[-1000.0f64], [-1000.5]];
        let lse = log_sum_exp_nodes(&logs);
        // direct exponentiation would underflow to -inf
        assert_abs_diff_eq!(lse[0], -1000.0 + (1.0 + (-0.5f64).exp()).ln(), epsilon = 1e-12);
    }
}
