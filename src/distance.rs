//! Distance measures for clustering-style programs.
//!
//! Data points are sparse (sorted `(index, value)` pairs); cluster
//! centers come either sparse or dense. The sparse-against-dense
//! Euclidean path exploits that most data point entries are zero:
//! start from the center's squared norm and correct only the
//! positions the point actually occupies.

/// Sorted-by-index sparse vector slice.
pub type SparseSlice<'a> = &'a [(usize, f64)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMeasure {
    Euclidean,
    Manhattan,
    Chebyshev,
    Cosine,
}

/// Merge-walks two sparse vectors, yielding `(a_i, b_i)` for every
/// index occupied by either.
fn merged<'a>(
    a: SparseSlice<'a>,
    b: SparseSlice<'a>,
) -> impl Iterator<Item = (f64, f64)> + 'a {
    let mut ai = 0;
    let mut bi = 0;
    std::iter::from_fn(move || {
        match (a.get(ai), b.get(bi)) {
            (Some(&(ia, va)), Some(&(ib, vb))) => {
                if ia < ib {
                    ai += 1;
                    Some((va, 0.0))
                } else if ib < ia {
                    bi += 1;
                    Some((0.0, vb))
                } else {
                    ai += 1;
                    bi += 1;
                    Some((va, vb))
                }
            }
            (Some(&(_, va)), None) => {
                ai += 1;
                Some((va, 0.0))
            }
            (None, Some(&(_, vb))) => {
                bi += 1;
                Some((0.0, vb))
            }
            (None, None) => None,
        }
    })
}

pub fn euclidean_sparse(point: SparseSlice<'_>, center: SparseSlice<'_>) -> f64 {
    merged(point, center)
        .map(|(p, c)| (p - c) * (p - c))
        .sum::<f64>()
        .sqrt()
}

/// Dense center: `‖c‖² + Σ_nz ((p_i - c_i)² - c_i²)`, touching only
/// the point's nonzero positions.
pub fn euclidean_dense(point: SparseSlice<'_>, center: &[f64]) -> f64 {
    let mut dist: f64 = center.iter().map(|c| c * c).sum();
    for &(idx, value) in point {
        let c = center[idx];
        dist += (value - c) * (value - c) - c * c;
    }
    // Accumulated cancellation can push the sum a hair negative.
    dist.max(0.0).sqrt()
}

pub fn manhattan_sparse(point: SparseSlice<'_>, center: SparseSlice<'_>) -> f64 {
    merged(point, center).map(|(p, c)| (p - c).abs()).sum()
}

pub fn manhattan_dense(point: SparseSlice<'_>, center: &[f64]) -> f64 {
    let mut total: f64 = center.iter().map(|c| c.abs()).sum();
    for &(idx, value) in point {
        let c = center[idx];
        total += (value - c).abs() - c.abs();
    }
    total
}

pub fn chebyshev_sparse(point: SparseSlice<'_>, center: SparseSlice<'_>) -> f64 {
    merged(point, center).fold(0.0, |acc, (p, c)| acc.max((p - c).abs()))
}

pub fn chebyshev_dense(point: SparseSlice<'_>, center: &[f64]) -> f64 {
    let mut occupied = point.iter().peekable();
    let mut best = 0.0f64;
    for (idx, &c) in center.iter().enumerate() {
        let p = match occupied.peek() {
            Some(&&(pidx, value)) if pidx == idx => {
                occupied.next();
                value
            }
            _ => 0.0,
        };
        best = best.max((p - c).abs());
    }
    best
}

pub fn cosine_sparse(point: SparseSlice<'_>, center: SparseSlice<'_>) -> f64 {
    let dot: f64 = merged(point, center).map(|(p, c)| p * c).sum();
    let norm_p: f64 = point.iter().map(|&(_, v)| v * v).sum::<f64>().sqrt();
    let norm_c: f64 = center.iter().map(|&(_, v)| v * v).sum::<f64>().sqrt();
    1.0 - dot / (norm_p * norm_c)
}

pub fn cosine_dense(point: SparseSlice<'_>, center: &[f64]) -> f64 {
    let dot: f64 = point.iter().map(|&(idx, v)| v * center[idx]).sum();
    let norm_p: f64 = point.iter().map(|&(_, v)| v * v).sum::<f64>().sqrt();
    let norm_c: f64 = center.iter().map(|c| c * c).sum::<f64>().sqrt();
    1.0 - dot / (norm_p * norm_c)
}

/// Dispatch on the configured measure, dense-center form.
pub fn distance(measure: DistanceMeasure, point: SparseSlice<'_>, center: &[f64]) -> f64 {
    match measure {
        DistanceMeasure::Euclidean => euclidean_dense(point, center),
        DistanceMeasure::Manhattan => manhattan_dense(point, center),
        DistanceMeasure::Chebyshev => chebyshev_dense(point, center),
        DistanceMeasure::Cosine => cosine_dense(point, center),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn densify(sparse: SparseSlice<'_>, len: usize) -> Vec<f64> {
        let mut dense = vec![0.0; len];
        for &(idx, v) in sparse {
            dense[idx] = v;
        }
        dense
    }

    fn reference_euclidean(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    }

    const POINT: &[(usize, f64)] = &[(1, 2.0), (4, -3.5), (7, 0.25)];
    const CENTER: &[f64] = &[0.5, 1.0, -2.0, 0.0, 4.0, 0.0, 1.5, -0.75];

    #[test]
    fn sparse_euclidean_matches_dense_norm() {
        let dense_point = densify(POINT, CENTER.len());
        let expected = reference_euclidean(&dense_point, CENTER);
        assert!((euclidean_dense(POINT, CENTER) - expected).abs() < EPS);
        let sparse_center: Vec<(usize, f64)> = CENTER
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, v)| (i, *v))
            .collect();
        assert!((euclidean_sparse(POINT, &sparse_center) - expected).abs() < EPS);
    }

    #[test]
    fn manhattan_matches_reference() {
        let dense_point = densify(POINT, CENTER.len());
        let expected: f64 = dense_point
            .iter()
            .zip(CENTER)
            .map(|(p, c)| (p - c).abs())
            .sum();
        assert!((manhattan_dense(POINT, CENTER) - expected).abs() < EPS);
    }

    #[test]
    fn chebyshev_matches_reference() {
        let dense_point = densify(POINT, CENTER.len());
        let expected = dense_point
            .iter()
            .zip(CENTER)
            .fold(0.0f64, |acc, (p, c)| acc.max((p - c).abs()));
        assert!((chebyshev_dense(POINT, CENTER) - expected).abs() < EPS);
    }

    #[test]
    fn cosine_of_parallel_vectors_is_zero() {
        let point: &[(usize, f64)] = &[(0, 2.0), (3, 4.0)];
        let center = [1.0, 0.0, 0.0, 2.0];
        assert!(cosine_dense(point, &center).abs() < EPS);
        let sparse_center: &[(usize, f64)] = &[(0, 1.0), (3, 2.0)];
        assert!(cosine_sparse(point, sparse_center).abs() < EPS);
    }

    #[test]
    fn zero_distance_to_itself() {
        let dense_point = densify(POINT, CENTER.len());
        for measure in [
            DistanceMeasure::Euclidean,
            DistanceMeasure::Manhattan,
            DistanceMeasure::Chebyshev,
        ] {
            assert!(distance(measure, POINT, &dense_point).abs() < EPS, "{measure:?}");
        }
    }
}
