//! Coarse exhaustive (shift, stretch) search and spline-continuity refinement.

use ndarray::Array2;

use crate::steps::{make_odd, plateau_positions};
use crate::{
    common_range_trim, interp_linear, linspace, nearest_index, savgol_filter, AlignmentConfig,
    AlignmentTransform, CalError, Profile,
};

/// Result of the coarse grid search. The quality matrix is retained for the
/// refinement stage.
#[derive(Clone, Debug)]
pub struct GridSearch {
    pub m_values: Vec<f64>,
    pub t_values: Vec<f64>,
    /// Overlap score per (stretch index, shift index); higher is better.
    pub quality: Array2<f64>,
    pub best: AlignmentTransform,
    pub best_quality: f64,
}

/// Exhaustive search for the (m, t) overlaying the calibration step pattern
/// onto the measurement's derivative structure.
pub fn grid_align(
    steps: &[f64],
    cal: &Profile,
    meas: &Profile,
    cfg: &AlignmentConfig,
) -> Result<GridSearch, CalError> {
    if steps.is_empty() {
        return Err(CalError::DegenerateInput(
            "no step positions to align".to_string(),
        ));
    }
    let meas_lo = meas.x_min();
    let meas_hi = meas.x_max();
    if !(meas_hi - meas_lo > 0.0) {
        return Err(CalError::DegenerateInput(
            "measurement profile has zero position span".to_string(),
        ));
    }

    let r_m = cfg.stretch_resolution.max(2);
    let r_t = cfg.shift_resolution.max(2);
    let m_values = linspace(
        1.0 + cfg.stretch_min_pct / 100.0,
        1.0 + cfg.stretch_max_pct / 100.0,
        r_m,
    );

    let step_lo = steps.iter().cloned().fold(f64::INFINITY, f64::min);
    let step_hi = steps.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let (ref_lo, ref_hi) = if cfg.widen_search {
        (cal.x_min(), cal.x_max())
    } else {
        (step_lo, step_hi)
    };
    // Feasible overlap at nominal stretch: at least one step inside the
    // measurement extent.
    let t_values = linspace(meas_lo - ref_hi, meas_hi - ref_lo, r_t);

    // Smoothed absolute derivative of the measurement, resampled onto a
    // search axis dense enough for the full transform span.
    let width = make_odd(cfg.filter_width.max(3));
    let smoothed = savgol_filter(meas.ys(), width, cfg.filter_order)?;
    let mxs = meas.xs();
    let mut deriv: Vec<(f64, f64)> = smoothed
        .windows(2)
        .enumerate()
        .map(|(i, w)| (0.5 * (mxs[i] + mxs[i + 1]), (w[1] - w[0]).abs()))
        .collect();
    deriv.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    let dxs: Vec<f64> = deriv.iter().map(|p| p.0).collect();
    let dys: Vec<f64> = deriv.iter().map(|p| p.1).collect();

    let mut axis_lo = meas_lo;
    let mut axis_hi = meas_hi;
    for &m in &[m_values[0], m_values[m_values.len() - 1]] {
        for &t in &[t_values[0], t_values[t_values.len() - 1]] {
            for &s in &[step_lo, step_hi] {
                let p = m * s + t;
                axis_lo = axis_lo.min(p);
                axis_hi = axis_hi.max(p);
            }
        }
    }
    let density = meas.len() as f64 / (meas_hi - meas_lo);
    let n_axis = (((axis_hi - axis_lo) * density).ceil() as usize).max(2);
    let d_axis = (axis_hi - axis_lo) / (n_axis - 1) as f64;
    // Zero outside the measurement extent, so hypotheses that land steps
    // off the data accumulate nothing.
    let resampled: Vec<f64> = (0..n_axis)
        .map(|i| {
            let x = axis_lo + d_axis * i as f64;
            if x < dxs[0] || x > dxs[dxs.len() - 1] {
                0.0
            } else {
                interp_linear(x, &dxs, &dys)
            }
        })
        .collect();

    let mut quality = Array2::zeros((r_m, r_t));
    for (i, &m) in m_values.iter().enumerate() {
        for (j, &t) in t_values.iter().enumerate() {
            let mut q = 0.0;
            for &s in steps {
                let p = m * s + t;
                let k = ((p - axis_lo) / d_axis).round().clamp(0.0, (n_axis - 1) as f64);
                q += resampled[k as usize];
            }
            quality[[i, j]] = q;
        }
    }

    let best_quality = quality.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    // Ties on the maximum are resolved by averaging the tied coordinates.
    let mut m_sum = 0.0;
    let mut t_sum = 0.0;
    let mut ties = 0usize;
    for ((i, j), &q) in quality.indexed_iter() {
        if q == best_quality {
            m_sum += m_values[i];
            t_sum += t_values[j];
            ties += 1;
        }
    }
    let best = AlignmentTransform {
        m: m_sum / ties as f64,
        t: t_sum / ties as f64,
    };

    Ok(GridSearch {
        m_values,
        t_values,
        quality,
        best,
        best_quality,
    })
}

/// Refined optimum selected by the spline-continuity cost (lower is better).
#[derive(Clone, Copy, Debug)]
pub struct FineSearch {
    pub transform: AlignmentTransform,
    pub cost: f64,
    /// Candidates that had usable overlap and were scored.
    pub evaluated: usize,
}

/// Re-score the top grid candidates with a metric independent of the coarse
/// one: the summed discontinuity of local splines at plateau boundaries.
pub fn fine_align(
    grid: &GridSearch,
    steps: &[f64],
    cal: &Profile,
    meas: &Profile,
    cfg: &AlignmentConfig,
) -> Result<FineSearch, CalError> {
    let candidates = top_candidates(grid, cfg.fine_candidates.max(1));
    if candidates.is_empty() {
        return Err(CalError::DegenerateInput(
            "quality matrix has no positive cells".to_string(),
        ));
    }
    let mut best: Option<(AlignmentTransform, f64)> = None;
    let mut evaluated = 0usize;
    for tr in candidates {
        let Some(cost) = candidate_cost(tr, steps, cal, meas)? else {
            continue;
        };
        evaluated += 1;
        if best.map_or(true, |(_, c)| cost < c) {
            best = Some((tr, cost));
        }
    }
    let (transform, cost) = best.ok_or_else(|| {
        CalError::DegenerateInput("no grid candidate had usable overlap".to_string())
    })?;
    Ok(FineSearch {
        transform,
        cost,
        evaluated,
    })
}

/// Greedy non-overlapping extraction: take the global argmax, zero that cell,
/// repeat.
fn top_candidates(grid: &GridSearch, count: usize) -> Vec<AlignmentTransform> {
    let mut q = grid.quality.clone();
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let mut bi = 0;
        let mut bj = 0;
        let mut bv = f64::NEG_INFINITY;
        for ((i, j), &v) in q.indexed_iter() {
            if v > bv {
                bv = v;
                bi = i;
                bj = j;
            }
        }
        if bv <= 0.0 {
            break;
        }
        out.push(AlignmentTransform {
            m: grid.m_values[bi],
            t: grid.t_values[bj],
        });
        q[[bi, bj]] = 0.0;
    }
    out
}

/// Cost of one candidate; `None` when the transform leaves no usable common
/// range. Spline construction failures abort the whole refinement.
fn candidate_cost(
    tr: AlignmentTransform,
    steps: &[f64],
    cal: &Profile,
    meas: &Profile,
) -> Result<Option<f64>, CalError> {
    let cal_t = cal.transformed(tr);
    let (cal_c, meas_c) = match common_range_trim(&cal_t, meas) {
        Ok(pair) => pair,
        Err(_) => return Ok(None),
    };
    let lo = cal_c.x_min();
    let hi = cal_c.x_max();
    let steps_t: Vec<f64> = steps
        .iter()
        .map(|&s| tr.apply(s))
        .filter(|&s| s > lo && s < hi)
        .collect();
    let centers = plateau_positions(cal_c.x_first(), cal_c.x_last(), &steps_t);

    let resampled = spline_resample(&cal_c, &meas_c)?;
    let n = meas_c.len();
    let mut bounds: Vec<usize> = centers
        .iter()
        .map(|&c| nearest_index(meas_c.xs(), c).0)
        .collect();
    bounds.sort_unstable();
    bounds.dedup();
    if bounds.len() < 2 {
        // Duplicate slice points degrade to the observed extremes.
        bounds = vec![0, n - 1];
    }

    let mut cost = 0.0;
    for w in bounds.windows(2) {
        let pred = extend_segment(meas_c.xs(), &resampled, w[0], w[1])?;
        cost += (pred - resampled[w[1]]).abs();
    }
    Ok(Some(cost))
}

/// Calibration values on the measurement grid, via a natural cubic
/// interpolating spline of the transformed calibration profile.
fn spline_resample(cal: &Profile, meas: &Profile) -> Result<Vec<f64>, CalError> {
    let pts: Vec<(f64, f64)> = cal
        .xs()
        .iter()
        .copied()
        .zip(cal.ys().iter().copied())
        .collect();
    let spline = CubicSpline::new(pts)?;
    Ok(meas.xs().iter().map(|&x| spline.eval(x)).collect())
}

/// Fit the segment `[from, to)` and extend it to the sample at `to`.
/// Segments shorter than 3 points fall back to degree 1, nudging the left
/// index to keep at least 2 points.
fn extend_segment(xs: &[f64], ys: &[f64], from: usize, to: usize) -> Result<f64, CalError> {
    let lo = if to - from >= 2 {
        from
    } else {
        to.saturating_sub(2)
    };
    let pts: Vec<(f64, f64)> = (lo..to).map(|i| (xs[i], ys[i])).collect();
    if pts.len() < 2 {
        return Ok(ys[to]);
    }
    let target = xs[to];
    if pts.len() >= 3 {
        let spline = CubicSpline::new(pts)?;
        Ok(spline.eval(target))
    } else {
        let (x0, y0) = pts[0];
        let (x1, y1) = pts[1];
        let dx = x1 - x0;
        if dx == 0.0 {
            return Err(CalError::DegenerateInput(
                "duplicate positions in spline segment".to_string(),
            ));
        }
        Ok(y0 + (y1 - y0) * (target - x0) / dx)
    }
}

/// Natural cubic interpolating spline; evaluation beyond the knots extends
/// the end cubics.
pub(crate) struct CubicSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Second derivatives at the knots.
    m2: Vec<f64>,
}

impl CubicSpline {
    pub(crate) fn new(mut pts: Vec<(f64, f64)>) -> Result<Self, CalError> {
        if pts.len() < 2 {
            return Err(CalError::DegenerateInput(
                "spline needs at least 2 points".to_string(),
            ));
        }
        pts.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        for w in pts.windows(2) {
            if w[1].0 <= w[0].0 {
                return Err(CalError::DegenerateInput(
                    "duplicate positions in spline input".to_string(),
                ));
            }
        }
        let xs: Vec<f64> = pts.iter().map(|p| p.0).collect();
        let ys: Vec<f64> = pts.iter().map(|p| p.1).collect();
        let n = xs.len();
        let mut m2 = vec![0.0; n];
        if n > 2 {
            // Thomas solve of the natural-spline tridiagonal system.
            let mut sub = vec![0.0; n];
            let mut diag = vec![0.0; n];
            let mut sup = vec![0.0; n];
            let mut rhs = vec![0.0; n];
            for i in 1..n - 1 {
                let h0 = xs[i] - xs[i - 1];
                let h1 = xs[i + 1] - xs[i];
                sub[i] = h0;
                diag[i] = 2.0 * (h0 + h1);
                sup[i] = h1;
                rhs[i] = 6.0 * ((ys[i + 1] - ys[i]) / h1 - (ys[i] - ys[i - 1]) / h0);
            }
            for i in 2..n - 1 {
                let w = sub[i] / diag[i - 1];
                diag[i] -= w * sup[i - 1];
                rhs[i] -= w * rhs[i - 1];
            }
            for i in (1..n - 1).rev() {
                let above = if i + 1 < n - 1 { m2[i + 1] } else { 0.0 };
                m2[i] = (rhs[i] - sup[i] * above) / diag[i];
            }
        }
        Ok(Self { xs, ys, m2 })
    }

    pub(crate) fn eval(&self, x: f64) -> f64 {
        let n = self.xs.len();
        let hi = self.xs.partition_point(|&v| v < x).clamp(1, n - 1);
        let i = hi - 1;
        let h = self.xs[i + 1] - self.xs[i];
        let a = (self.xs[i + 1] - x) / h;
        let b = (x - self.xs[i]) / h;
        a * self.ys[i]
            + b * self.ys[i + 1]
            + ((a * a * a - a) * self.m2[i] + (b * b * b - b) * self.m2[i + 1]) * h * h / 6.0
    }
}
