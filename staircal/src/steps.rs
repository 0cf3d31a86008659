//! Staircase transition detection and plateau anchor estimation.

use crate::{
    nearest_index, percentile, savgol_filter, AnchorPointSet, CalError, CalibrationKind, Profile,
};

/// Height floor for derivative peaks, as a percentile of the signal.
const HEIGHT_FLOOR_PCT: f64 = 15.0;
/// Minimal odd smoothing window for the forced retry.
const FORCED_SMOOTH_WIDTH: usize = 3;

/// Locate `transitions` staircase transitions in the profile. Returns `None`
/// only when the position span is degenerate; too few detected peaks degrade
/// to a synthesized evenly spaced result, never an error.
pub fn detect_steps(
    profile: &Profile,
    transitions: usize,
    min_spacing: f64,
    smooth_width: usize,
) -> Result<Option<Vec<f64>>, CalError> {
    let xs = profile.xs();
    let ys = profile.ys();
    let span = xs[xs.len() - 1] - xs[0];
    if span == 0.0 {
        return Ok(None);
    }
    if transitions == 0 {
        return Ok(Some(Vec::new()));
    }

    let density = (xs.len() - 1) as f64 / span.abs();
    let spacing_idx = ((min_spacing * density).round() as usize).max(1);

    let mut signal = derivative_magnitude(ys, smooth_width)?;
    let mut peaks = find_peaks(&signal, spacing_idx, percentile(&signal, HEIGHT_FLOOR_PCT));

    if peaks.len() < transitions {
        signal = derivative_magnitude(ys, FORCED_SMOOTH_WIDTH)?;
        peaks = find_peaks(&signal, spacing_idx, percentile(&signal, HEIGHT_FLOOR_PCT));
    }

    if peaks.len() < transitions {
        // Degraded but deterministic fallback: evenly spaced transitions
        // spanning at most `min_spacing * transitions` from the segment start.
        let reach = span.abs().min(min_spacing * transitions as f64);
        let dir = span.signum();
        let out = (1..=transitions)
            .map(|i| xs[0] + dir * reach * i as f64 / (transitions + 1) as f64)
            .collect();
        return Ok(Some(out));
    }

    while peaks.len() > transitions {
        // Greedy pruning of the weakest peak, not a global optimisation.
        let weakest = peaks
            .iter()
            .enumerate()
            .min_by(|a, b| signal[*a.1].partial_cmp(&signal[*b.1]).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        peaks.remove(weakest);
    }

    // A derivative peak at index i sits between samples i and i+1.
    let positions = peaks.iter().map(|&i| 0.5 * (xs[i] + xs[i + 1])).collect();
    Ok(Some(positions))
}

/// Smoothed absolute first difference, normalized by its smallest nonzero
/// magnitude. An all-zero derivative degrades to a zero signal.
fn derivative_magnitude(values: &[f64], smooth_width: usize) -> Result<Vec<f64>, CalError> {
    let smoothed = if smooth_width > 0 {
        savgol_filter(values, make_odd(smooth_width), 1)?
    } else {
        values.to_vec()
    };
    let diffs: Vec<f64> = smoothed.windows(2).map(|w| w[1] - w[0]).collect();
    let scale = diffs
        .iter()
        .filter(|d| **d != 0.0)
        .map(|d| d.abs())
        .fold(f64::INFINITY, f64::min);
    if !scale.is_finite() || scale == 0.0 {
        return Ok(vec![0.0; diffs.len()]);
    }
    Ok(diffs.iter().map(|d| d.abs() / scale).collect())
}

pub(crate) fn make_odd(width: usize) -> usize {
    if width % 2 == 0 {
        width + 1
    } else {
        width
    }
}

/// Local maxima at least `min_height` tall, accepted in descending height
/// order with a minimum index spacing between accepted peaks.
fn find_peaks(signal: &[f64], min_distance: usize, min_height: f64) -> Vec<usize> {
    let n = signal.len();
    if n < 3 {
        return Vec::new();
    }
    let mut candidates: Vec<usize> = (1..n - 1)
        .filter(|&i| signal[i] > signal[i - 1] && signal[i] >= signal[i + 1])
        .filter(|&i| signal[i] >= min_height)
        .collect();
    candidates.sort_by(|&a, &b| {
        signal[b]
            .partial_cmp(&signal[a])
            .unwrap()
            .then(a.cmp(&b))
    });
    let mut accepted: Vec<usize> = Vec::new();
    for &c in &candidates {
        if accepted.iter().all(|&a| a.abs_diff(c) >= min_distance) {
            accepted.push(c);
        }
    }
    accepted.sort_unstable();
    accepted
}

/// Plateau center positions: midpoints between the segment edges and each
/// consecutive pair of transitions (K transitions give K+1 centers).
pub fn plateau_positions(start: f64, end: f64, steps: &[f64]) -> Vec<f64> {
    let mut bounds = Vec::with_capacity(steps.len() + 2);
    bounds.push(start);
    bounds.extend_from_slice(steps);
    bounds.push(end);
    bounds.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
}

#[derive(Clone, Debug, Default)]
pub struct PlateauOptions {
    pub include_left_edge: bool,
    pub include_right_edge: bool,
    /// Extra anchors per inter-plateau span, linearly spaced in value space.
    pub subdivisions: Vec<usize>,
}

/// Build the matched anchor set from plateau centers, optional edge anchors
/// and value-space subdivision, then pair every anchor with its nearest
/// measurement value.
pub fn estimate_anchors(
    cal: &Profile,
    meas: &Profile,
    steps: &[f64],
    opts: &PlateauOptions,
    kind: &CalibrationKind,
) -> Result<AnchorPointSet, CalError> {
    let xs = cal.xs();
    let ys = cal.ys();
    let centers = plateau_positions(xs[0], xs[xs.len() - 1], steps);

    let mut pos: Vec<f64> = Vec::with_capacity(centers.len() + 2);
    let mut val: Vec<f64> = Vec::with_capacity(centers.len() + 2);
    for &c in &centers {
        let (i, p) = nearest_index(xs, c);
        pos.push(p);
        val.push(ys[i]);
    }
    if opts.include_left_edge {
        pos.insert(0, xs[0]);
        val.insert(0, ys[0]);
    }
    if opts.include_right_edge {
        pos.push(xs[xs.len() - 1]);
        val.push(ys[ys.len() - 1]);
    }

    let mut out_pos: Vec<f64> = Vec::new();
    let mut out_val: Vec<f64> = Vec::new();
    for i in 0..val.len() {
        out_pos.push(pos[i]);
        out_val.push(val[i]);
        if i + 1 >= val.len() {
            break;
        }
        let extra = opts.subdivisions.get(i).copied().unwrap_or(0);
        if extra == 0 {
            continue;
        }
        // Targets are spaced in value, then located by nearest value lookup
        // restricted to the span between the two plateaus.
        let a = nearest_index(xs, pos[i]).0;
        let b = nearest_index(xs, pos[i + 1]).0;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let seg_x = &xs[lo..=hi];
        let seg_y = &ys[lo..=hi];
        let sign = (val[i + 1] - val[i]).signum();
        let height = (val[i + 1] - val[i]).abs();
        for j in 0..extra {
            let target = val[i] + sign * height * (j + 1) as f64 / (extra + 1) as f64;
            let (k, _) = nearest_index(seg_y, target);
            out_pos.push(seg_x[k]);
            out_val.push(target);
        }
    }

    let measured = measured_at_positions(meas, &out_pos);
    AnchorPointSet::new(measured, out_val, kind.descending_anchors())
}

/// Caller-supplied calibration anchor values; each is located by nearest
/// value lookup over the whole calibration profile.
pub fn manual_anchor_set(
    cal: &Profile,
    meas: &Profile,
    values: &[f64],
    kind: &CalibrationKind,
) -> Result<AnchorPointSet, CalError> {
    let positions: Vec<f64> = values
        .iter()
        .map(|&v| {
            let (i, _) = nearest_index(cal.ys(), v);
            cal.xs()[i]
        })
        .collect();
    let measured = measured_at_positions(meas, &positions);
    AnchorPointSet::new(measured, values.to_vec(), kind.descending_anchors())
}

fn measured_at_positions(meas: &Profile, positions: &[f64]) -> Vec<f64> {
    positions
        .iter()
        .map(|&p| {
            let (i, _) = nearest_index(meas.xs(), p);
            meas.ys()[i]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Profile;

    /// Staircase with `levels` plateaus of `per` samples each; transitions at
    /// multiples of `per` in index space. Deterministic pseudo-noise.
    fn staircase(levels: usize, per: usize, noise: f64) -> Profile {
        let n = levels * per;
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| {
                let level = (i / per) as f64;
                level * 2.0 + noise * ((i as f64 * 12.9898).sin())
            })
            .collect();
        Profile::new(x, y).unwrap()
    }

    #[test]
    fn recovers_staircase_transitions() {
        let profile = staircase(5, 40, 0.01);
        let found = detect_steps(&profile, 4, 1.0, 0).unwrap().unwrap();
        assert_eq!(found.len(), 4);
        // True transitions sit between samples 40k-1 and 40k, i.e. at
        // x = (40k - 0.5) * 0.1; allow one sample of slack.
        for (k, &pos) in found.iter().enumerate() {
            let truth = ((k + 1) * 40) as f64 * 0.1 - 0.05;
            assert!(
                (pos - truth).abs() <= 0.1,
                "transition {k}: found {pos}, expected {truth}"
            );
        }
    }

    #[test]
    fn recovers_transitions_with_smoothing() {
        let profile = staircase(5, 40, 0.05);
        let found = detect_steps(&profile, 4, 1.0, 3).unwrap().unwrap();
        assert_eq!(found.len(), 4);
        for (k, &pos) in found.iter().enumerate() {
            let truth = ((k + 1) * 40) as f64 * 0.1 - 0.05;
            assert!((pos - truth).abs() <= 0.2, "found {pos}, expected {truth}");
        }
    }

    #[test]
    fn flat_profile_falls_back_to_even_spacing() {
        let x: Vec<f64> = (0..100).map(|i| i as f64 * 0.1).collect();
        let y = vec![1.0; 100];
        let profile = Profile::new(x, y).unwrap();
        let found = detect_steps(&profile, 4, 0.5, 0).unwrap().unwrap();
        assert_eq!(found.len(), 4);
        // Evenly spaced over min(span, spacing * K) = 2.0 from the start.
        for (k, &pos) in found.iter().enumerate() {
            let expected = 2.0 * (k + 1) as f64 / 5.0;
            assert!((pos - expected).abs() < 1e-9, "{pos} vs {expected}");
        }
    }

    #[test]
    fn zero_span_yields_no_result() {
        let profile = Profile::new(vec![1.0, 1.0, 1.0], vec![0.0, 1.0, 2.0]).unwrap();
        assert!(detect_steps(&profile, 2, 0.5, 0).unwrap().is_none());
    }

    #[test]
    fn prunes_excess_peaks_by_amplitude() {
        // Four jumps of different heights; ask for the two largest.
        let mut y = Vec::new();
        for level in [0.0, 5.0, 5.5, 11.0, 11.2] {
            for _ in 0..20 {
                y.push(level);
            }
        }
        let x: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
        let profile = Profile::new(x, y).unwrap();
        let found = detect_steps(&profile, 2, 2.0, 0).unwrap().unwrap();
        assert_eq!(found.len(), 2);
        // The two 5-and-change jumps dominate the 0.5/0.2 ones.
        assert!((found[0] - 19.5).abs() <= 1.0);
        assert!((found[1] - 59.5).abs() <= 1.0);
    }

    #[test]
    fn plateau_positions_are_midpoints() {
        let centers = plateau_positions(0.0, 10.0, &[2.0, 6.0]);
        assert_eq!(centers, vec![1.0, 4.0, 8.0]);
    }

    #[test]
    fn estimate_anchors_with_edges_and_subdivision() {
        let profile = staircase(3, 30, 0.0);
        let meas = staircase(3, 30, 0.0);
        let steps = [2.95, 5.95];
        let opts = PlateauOptions {
            include_left_edge: true,
            include_right_edge: true,
            subdivisions: vec![0, 1, 0, 0],
        };
        let set = estimate_anchors(&profile, &meas, &steps, &opts, &CalibrationKind::Resistivity);
        // Duplicate edge values collide with plateau values on a perfectly
        // flat staircase: that is the ambiguous-anchor hard error.
        assert!(matches!(set, Err(CalError::AmbiguousAnchors(_))));
    }

    #[test]
    fn estimate_anchors_counts_subdivisions() {
        // Ramped staircase so every anchor value is distinct.
        let n = 90;
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| (i / 30) as f64 * 3.0 + i as f64 * 0.01)
            .collect();
        let cal = Profile::new(x.clone(), y.clone()).unwrap();
        let meas = Profile::new(x, y).unwrap();
        let steps = [2.95, 5.95];
        let opts = PlateauOptions {
            subdivisions: vec![2, 0],
            ..Default::default()
        };
        let set =
            estimate_anchors(&cal, &meas, &steps, &opts, &CalibrationKind::Resistivity).unwrap();
        // 3 plateau centers + 2 subdivision anchors.
        assert_eq!(set.len(), 5);
        // Ascending calibration order for resistivity.
        for w in set.calibration.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn manual_anchors_resolve_positions_by_value() {
        let n = 90;
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = (0..n).map(|i| i as f64 * 0.05).collect();
        let cal = Profile::new(x.clone(), y.clone()).unwrap();
        let meas = Profile::new(x, y).unwrap();
        let set = manual_anchor_set(&cal, &meas, &[0.5, 2.0], &CalibrationKind::Resistivity)
            .unwrap();
        assert_eq!(set.len(), 2);
        assert!((set.measured[0] - 0.5).abs() <= 0.05);
        assert!((set.measured[1] - 2.0).abs() <= 0.05);
    }

    #[test]
    fn charge_carrier_anchors_descend() {
        let n = 60;
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = (0..n).map(|i| i as f64 * 0.05).collect();
        let cal = Profile::new(x.clone(), y.clone()).unwrap();
        let meas = Profile::new(x, y).unwrap();
        let set = manual_anchor_set(&cal, &meas, &[0.5, 2.0], &CalibrationKind::ChargeCarrier)
            .unwrap();
        assert_eq!(set.calibration, vec![2.0, 0.5]);
    }
}
