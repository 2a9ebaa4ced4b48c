//! Proportional piece allocation (largest remainder / Hamilton's method)
//!
//! Weights that are not finite or not positive count as inactive and get no
//! pieces. Ties in remainder and in weight go to the lower index.

use std::cmp::Ordering;

/// Split `size` pieces across `weights`.
///
/// The result has one entry per weight and always sums to `size` when at
/// least one weight is active. If `size` is at least the number of active
/// entries, every active entry gets one piece or more; otherwise the `size`
/// heaviest entries get exactly one each.
pub fn allocate(size: usize, weights: &[f64]) -> Vec<usize> {
    let mut pieces = vec![0usize; weights.len()];
    let active: Vec<usize> = (0..weights.len())
        .filter(|&i| weights[i].is_finite() && weights[i] > 0.0)
        .collect();
    if active.is_empty() || size == 0 {
        return pieces;
    }

    if size < active.len() {
        let mut ranked = active;
        ranked.sort_by(|&a, &b| by_weight_desc(weights, a, b));
        for &i in ranked.iter().take(size) {
            pieces[i] = 1;
        }
        return pieces;
    }

    let total: f64 = active.iter().map(|&i| weights[i]).sum();
    let mut remainders: Vec<(usize, f64)> = Vec::with_capacity(active.len());
    let mut assigned = 0usize;
    for &i in &active {
        let quota = size as f64 * weights[i] / total;
        let whole = (quota.floor() as usize).min(size);
        pieces[i] = whole;
        assigned += whole;
        remainders.push((i, quota - whole as f64));
    }

    // Largest fractional remainder first, lower index on ties
    remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

    if assigned < size {
        for &(i, _) in remainders.iter().cycle().take(size - assigned) {
            pieces[i] += 1;
        }
    } else {
        // Rounding pushed the floors past `size`; take back from the smallest remainders
        let mut excess = assigned - size;
        for &(i, _) in remainders.iter().rev().cycle() {
            if excess == 0 {
                break;
            }
            if pieces[i] > 0 {
                pieces[i] -= 1;
                excess -= 1;
            }
        }
    }

    // Every active entry gets at least one piece
    for &i in &active {
        if pieces[i] > 0 {
            continue;
        }
        let donor = active
            .iter()
            .copied()
            .filter(|&j| pieces[j] > 1)
            .max_by_key(|&j| (pieces[j], j));
        if let Some(donor) = donor {
            pieces[donor] -= 1;
            pieces[i] += 1;
        }
    }

    pieces
}

fn by_weight_desc(weights: &[f64], a: usize, b: usize) -> Ordering {
    weights[b]
        .partial_cmp(&weights[a])
        .unwrap_or(Ordering::Equal)
        .then(a.cmp(&b))
}
