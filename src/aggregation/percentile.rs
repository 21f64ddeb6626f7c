//! Exact nearest-rank percentile over an in-memory sorted sample (resolved
//! open question, SPEC_FULL.md §4.4): `rank = ceil(p * n).max(1)`, 0-indexed
//! as `sorted[rank - 1]`. Grounded directly on the teacher's
//! `calculate_p95`/`calculate_p80` in `http_monitor.rs`.

/// `p` is a fraction in `[0, 1]`. Returns `None` for an empty sample.
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let rank = ((p * n as f64).ceil() as usize).max(1).min(n);
    Some(sorted[rank - 1])
}

pub fn p50(samples: &[f64]) -> Option<f64> {
    percentile(samples, 0.50)
}
pub fn p95(samples: &[f64]) -> Option<f64> {
    percentile(samples, 0.95)
}
pub fn p99(samples: &[f64]) -> Option<f64> {
    percentile(samples, 0.99)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sample_is_none() {
        assert_eq!(percentile(&[], 0.95), None);
    }

    #[test]
    fn single_sample_is_itself_at_any_percentile() {
        assert_eq!(p50(&[42.0]), Some(42.0));
        assert_eq!(p99(&[42.0]), Some(42.0));
    }

    #[test]
    fn matches_nearest_rank_for_ten_samples() {
        let samples: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        // p95 of 10 samples: rank = ceil(0.95*10) = 10 -> sorted[9] = 10.0
        assert_eq!(p95(&samples), Some(10.0));
        // p50 of 10 samples: rank = ceil(0.50*10) = 5 -> sorted[4] = 5.0
        assert_eq!(p50(&samples), Some(5.0));
    }
}
