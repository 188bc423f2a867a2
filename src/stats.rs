//! Small numeric helpers for ensemble aggregation and CORRELATION.

use std::collections::HashMap;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max.is_infinite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

pub fn logmeanexp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    logsumexp(values) - (values.len() as f64).ln()
}

/// Splits `n` over `weights` in proportion, rounding by largest remainder.
/// Ties go to the earlier entry. Non-positive total weight splits evenly.
pub fn apportion(n: usize, weights: &[f64]) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    let shares: Vec<f64> = if total > 0.0 {
        weights
            .iter()
            .map(|w| if w.is_finite() && *w > 0.0 { n as f64 * w / total } else { 0.0 })
            .collect()
    } else {
        vec![n as f64 / weights.len() as f64; weights.len()]
    };
    let mut counts: Vec<usize> = shares.iter().map(|s| s.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = shares[a] - shares[a].floor();
        let rb = shares[b] - shares[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    for &i in order.iter().take(n.saturating_sub(assigned)) {
        counts[i] += 1;
    }
    counts
}

/// Squared Pearson correlation.
pub fn pearson_r2(pairs: &[(f64, f64)]) -> Option<f64> {
    let n = pairs.len() as f64;
    if pairs.len() < 2 {
        return None;
    }
    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        sxy += (x - mx) * (y - my);
        sxx += (x - mx) * (x - mx);
        syy += (y - my) * (y - my);
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy * sxy / (sxx * syy))
}

/// Cramér's phi for two categorical samples.
pub fn cramer_phi(pairs: &[(String, String)]) -> Option<f64> {
    let n = pairs.len() as f64;
    let mut rows: HashMap<&str, f64> = HashMap::new();
    let mut cols: HashMap<&str, f64> = HashMap::new();
    let mut cells: HashMap<(&str, &str), f64> = HashMap::new();
    for (a, b) in pairs {
        *rows.entry(a).or_default() += 1.0;
        *cols.entry(b).or_default() += 1.0;
        *cells.entry((a, b)).or_default() += 1.0;
    }
    let k = rows.len().min(cols.len());
    if k < 2 {
        return None;
    }
    let mut chi2 = 0.0;
    for (a, ra) in &rows {
        for (b, cb) in &cols {
            let expected = ra * cb / n;
            let observed = cells.get(&(*a, *b)).copied().unwrap_or(0.0);
            chi2 += (observed - expected).powi(2) / expected;
        }
    }
    Some((chi2 / (n * (k as f64 - 1.0))).sqrt())
}

/// One-way ANOVA R^2: the share of variance in the numbers explained by
/// the groups.
pub fn anova_r2(pairs: &[(String, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let grand = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let mut groups: HashMap<&str, (f64, f64)> = HashMap::new();
    for (g, y) in pairs {
        let entry = groups.entry(g).or_default();
        entry.0 += y;
        entry.1 += 1.0;
    }
    if groups.len() < 2 {
        return None;
    }
    let total: f64 = pairs.iter().map(|p| (p.1 - grand).powi(2)).sum();
    if total == 0.0 {
        return None;
    }
    let between: f64 = groups
        .values()
        .map(|(sum, count)| count * (sum / count - grand).powi(2))
        .sum();
    Some(between / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logmeanexp_of_equal_values_is_the_value() {
        let v = logmeanexp(&[-1.5, -1.5, -1.5]);
        assert!((v + 1.5).abs() < 1e-12);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn apportion_preserves_the_total() {
        assert_eq!(apportion(10, &[1.0, 1.0, 1.0]), vec![4, 3, 3]);
        assert_eq!(apportion(5, &[0.0, 0.0]), vec![3, 2]);
        assert_eq!(apportion(7, &[3.0, 1.0]), vec![5, 2]);
        let counts = apportion(101, &[0.2, 0.5, 0.3]);
        assert_eq!(counts.iter().sum::<usize>(), 101);
    }

    #[test]
    fn perfectly_linear_data_has_unit_r2() {
        let pairs: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        assert!((pearson_r2(&pairs).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identical_categories_have_unit_phi() {
        let pairs: Vec<(String, String)> = ["a", "b", "a", "b"]
            .iter()
            .map(|s| (s.to_string(), s.to_string()))
            .collect();
        assert!((cramer_phi(&pairs).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn groups_that_explain_everything_have_unit_anova() {
        let pairs = vec![
            ("a".to_string(), 1.0),
            ("a".to_string(), 1.0),
            ("b".to_string(), 5.0),
            ("b".to_string(), 5.0),
        ];
        assert!((anova_r2(&pairs).unwrap() - 1.0).abs() < 1e-12);
    }
}
