// =============================================================================
// Statistics helpers — correlation, variance, quantiles
// =============================================================================
//
// Pure `&[f64]` helpers shared by the graduation learner and the robust-zone
// builder. Callers are expected to have filtered non-finite values already;
// every function still guards against them and returns `None` rather than
// propagating NaN into published tables.
// =============================================================================

/// Arithmetic mean. `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population variance. `None` for an empty slice.
pub fn population_variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.is_finite().then_some(var)
}

/// Population standard deviation. `None` for an empty slice.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    population_variance(values).map(f64::sqrt)
}

/// Pearson correlation between paired samples.
///
/// Pairs where either side is non-finite are skipped. Returns `None` when
/// fewer than two valid pairs remain or either side has zero variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys.iter())
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(x, y)| (*x, *y))
        .collect();

    if pairs.len() < 2 {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }

    let r = cov / (var_x.sqrt() * var_y.sqrt());
    // Floating point can push |r| marginally past 1.
    Some(r.clamp(-1.0, 1.0))
}

/// Quantile with linear interpolation over a **sorted** slice.
/// `q` in [0, 1]; `None` for an empty slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Sort a copy of `values` (finite entries only) ascending.
pub fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    out.sort_by(|a, b| a.partial_cmp(b).expect("finite values compare totally"));
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // ---- mean / variance -------------------------------------------------

    #[test]
    fn mean_of_empty_is_none() {
        assert!(mean(&[]).is_none());
    }

    #[test]
    fn population_variance_matches_hand_calc() {
        // Values 2, 4, 6: mean 4, squared deviations 4, 0, 4 → variance 8/3.
        let var = population_variance(&[2.0, 4.0, 6.0]).unwrap();
        assert!((var - 8.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn std_dev_of_constant_series_is_zero() {
        assert_eq!(std_dev(&[3.0, 3.0, 3.0]).unwrap(), 0.0);
    }

    // ---- pearson ---------------------------------------------------------

    #[test]
    fn pearson_perfect_positive() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [10.0, 20.0, 30.0, 40.0];
        assert!((pearson(&xs, &ys).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn pearson_perfect_negative() {
        let xs = [1.0, 2.0, 3.0];
        let ys = [6.0, 4.0, 2.0];
        assert!((pearson(&xs, &ys).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn pearson_skips_non_finite_pairs() {
        let xs = [1.0, f64::NAN, 2.0, 3.0];
        let ys = [10.0, 20.0, 20.0, 30.0];
        let r = pearson(&xs, &ys).unwrap();
        assert!(r > 0.9);
    }

    #[test]
    fn pearson_zero_variance_is_none() {
        assert!(pearson(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn pearson_single_pair_is_none() {
        assert!(pearson(&[1.0], &[2.0]).is_none());
    }

    // ---- quantiles -------------------------------------------------------

    #[test]
    fn quantile_interpolates() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(quantile_sorted(&sorted, 0.0).unwrap(), 10.0);
        assert_eq!(quantile_sorted(&sorted, 1.0).unwrap(), 40.0);
        assert_eq!(quantile_sorted(&sorted, 0.5).unwrap(), 25.0);
        // Q25 of four points: position 0.75 between 10 and 20.
        assert!((quantile_sorted(&sorted, 0.25).unwrap() - 17.5).abs() < 1e-12);
    }

    #[test]
    fn quantile_single_element() {
        assert_eq!(quantile_sorted(&[7.0], 0.9).unwrap(), 7.0);
    }

    #[test]
    fn sorted_finite_drops_nan() {
        let sorted = sorted_finite(&[3.0, f64::NAN, 1.0, f64::INFINITY, 2.0]);
        assert_eq!(sorted, vec![1.0, 2.0, 3.0]);
    }
}
