//! Core staircase-calibration library: aligns a measured 1-D profile against a
//! reference staircase profile and fits a monotone curve mapping raw signal to
//! calibrated physical quantity.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod align;
pub mod fit;
pub mod physics;
pub mod steps;

pub use align::{fine_align, grid_align, FineSearch, GridSearch};
pub use fit::{fit_calibration, CalibrationModel, FittedCalibration};
pub use physics::Dopant;
pub use steps::{detect_steps, estimate_anchors, plateau_positions, PlateauOptions};

#[derive(Error, Debug)]
pub enum CalError {
    #[error("degenerate input: {0}")]
    DegenerateInput(String),
    #[error("ambiguous anchors: duplicate calibration value {0}")]
    AmbiguousAnchors(f64),
    #[error("calibration fit did not converge: {0}")]
    FitDivergence(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unknown dopant species: {0}")]
    UnknownDopant(String),
}

/// Which physical quantity the calibration profile carries. The variant fixes
/// the anchor ordering direction and the reported denomination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationKind {
    ChargeCarrier,
    Resistivity,
    Custom(String),
}

impl CalibrationKind {
    /// Carrier-concentration staircases run from highest to lowest value;
    /// everything else is ordered low to high.
    pub fn descending_anchors(&self) -> bool {
        matches!(self, CalibrationKind::ChargeCarrier)
    }

    pub fn denomination(&self) -> &str {
        match self {
            CalibrationKind::ChargeCarrier => "charge carrier concentration [cm^-3]",
            CalibrationKind::Resistivity => "resistivity [Ohm cm]",
            CalibrationKind::Custom(denomination) => denomination,
        }
    }
}

/// Active sub-range of a profile, delimited by position value rather than index.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub low: f64,
    pub high: f64,
}

impl Window {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn sorted(self) -> (f64, f64) {
        if self.low <= self.high {
            (self.low, self.high)
        } else {
            (self.high, self.low)
        }
    }
}

/// Affine transform `position' = m * position + t` applied to the calibration
/// profile's position axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignmentTransform {
    pub m: f64,
    pub t: f64,
}

impl AlignmentTransform {
    pub fn apply(&self, position: f64) -> f64 {
        self.m * position + self.t
    }
}

/// An ordered (position, value) trace. Positions are monotonic in either
/// direction; all values finite, length at least two.
#[derive(Clone, Debug)]
pub struct Profile {
    x: Array1<f64>,
    y: Array1<f64>,
}

impl Profile {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, CalError> {
        if x.len() != y.len() {
            return Err(CalError::DegenerateInput(format!(
                "position/value length mismatch: {} vs {}",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(CalError::DegenerateInput(format!(
                "profile needs at least 2 points, got {}",
                x.len()
            )));
        }
        if !x.iter().chain(y.iter()).all(|v| v.is_finite()) {
            return Err(CalError::DegenerateInput(
                "profile contains non-finite values".to_string(),
            ));
        }
        Ok(Self::from_parts(x, y))
    }

    fn from_parts(x: Vec<f64>, y: Vec<f64>) -> Self {
        Self {
            x: Array1::from(x),
            y: Array1::from(y),
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self) -> &Array1<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub(crate) fn xs(&self) -> &[f64] {
        self.x.as_slice().unwrap()
    }

    pub(crate) fn ys(&self) -> &[f64] {
        self.y.as_slice().unwrap()
    }

    pub fn x_first(&self) -> f64 {
        self.x[0]
    }

    pub fn x_last(&self) -> f64 {
        self.x[self.x.len() - 1]
    }

    pub fn x_min(&self) -> f64 {
        self.x_first().min(self.x_last())
    }

    pub fn x_max(&self) -> f64 {
        self.x_first().max(self.x_last())
    }

    pub fn span(&self) -> f64 {
        (self.x_last() - self.x_first()).abs()
    }

    pub fn is_descending(&self) -> bool {
        self.x_last() < self.x_first()
    }

    /// Keep the points whose position falls inside `sorted(window)`, then
    /// reverse both sequences when `flipped`. When no point matches, the
    /// profile is returned unchanged (a recoverable no-data condition).
    pub fn crop(&self, window: Window, flipped: bool) -> Profile {
        let (lo, hi) = window.sorted();
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for i in 0..self.len() {
            let p = self.x[i];
            if p >= lo && p <= hi {
                xs.push(p);
                ys.push(self.y[i]);
            }
        }
        if xs.is_empty() {
            return self.clone();
        }
        if flipped {
            xs.reverse();
            ys.reverse();
        }
        Profile::from_parts(xs, ys)
    }

    pub fn flipped(&self) -> Profile {
        let mut xs = self.xs().to_vec();
        let mut ys = self.ys().to_vec();
        xs.reverse();
        ys.reverse();
        Profile::from_parts(xs, ys)
    }

    /// New profile with the transform applied to the position axis.
    pub fn transformed(&self, tr: AlignmentTransform) -> Profile {
        let xs = self.xs().iter().map(|&p| tr.apply(p)).collect();
        Profile::from_parts(xs, self.ys().to_vec())
    }
}

/// Index of the position closest to `value`; ties break to the first
/// occurrence.
pub fn nearest_index(positions: &[f64], value: f64) -> (usize, f64) {
    debug_assert!(!positions.is_empty());
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, &p) in positions.iter().enumerate() {
        let d = (p - value).abs();
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    (best, positions[best])
}

/// Trim both profiles to their overlapping position interval. Each profile is
/// sliced between the indices nearest to the other profile's end positions,
/// respecting its own direction.
pub fn common_range_trim(cal: &Profile, meas: &Profile) -> Result<(Profile, Profile), CalError> {
    let cal_t = slice_between(cal, meas.x_first(), meas.x_last());
    let meas_t = slice_between(meas, cal.x_first(), cal.x_last());
    if cal_t.len() < 2 || meas_t.len() < 2 {
        return Err(CalError::DegenerateInput(
            "profiles do not overlap after transform".to_string(),
        ));
    }
    Ok((cal_t, meas_t))
}

fn slice_between(profile: &Profile, a: f64, b: f64) -> Profile {
    let (i0, _) = nearest_index(profile.xs(), a);
    let (i1, _) = nearest_index(profile.xs(), b);
    let (lo, hi) = if i0 <= i1 { (i0, i1) } else { (i1, i0) };
    Profile::from_parts(
        profile.xs()[lo..=hi].to_vec(),
        profile.ys()[lo..=hi].to_vec(),
    )
}

/// Savitzky-Golay smoothing: local polynomial least squares over an odd
/// window, edge samples taken from the polynomial of the first/last full
/// window.
pub fn savgol_filter(values: &[f64], window: usize, order: usize) -> Result<Vec<f64>, CalError> {
    if window < 3 || window % 2 == 0 {
        return Err(CalError::InvalidParameter(format!(
            "smoothing window must be odd and >= 3, got {window}"
        )));
    }
    if order >= window {
        return Err(CalError::InvalidParameter(format!(
            "smoothing order {order} must be below window {window}"
        )));
    }
    if window > values.len() {
        return Err(CalError::InvalidParameter(format!(
            "smoothing window {window} exceeds {} samples",
            values.len()
        )));
    }

    let n = values.len();
    let half = window / 2;
    let mut out = vec![0.0; n];

    let head = polyfit_window(&values[..window], order)?;
    for (i, slot) in out.iter_mut().take(half).enumerate() {
        *slot = polyval(&head, i as f64);
    }
    let tail = polyfit_window(&values[n - window..], order)?;
    for i in (n - half)..n {
        out[i] = polyval(&tail, (i + window - n) as f64);
    }
    for i in half..(n - half) {
        let coeffs = polyfit_window(&values[i - half..=i + half], order)?;
        out[i] = polyval(&coeffs, half as f64);
    }
    Ok(out)
}

fn polyfit_window(values: &[f64], order: usize) -> Result<Vec<f64>, CalError> {
    let w = values.len();
    let a = DMatrix::from_fn(w, order + 1, |i, j| (i as f64).powi(j as i32));
    let b = DVector::from_fn(w, |i, _| values[i]);
    let ata = a.transpose() * &a;
    let atb = a.transpose() * b;
    ata.lu()
        .solve(&atb)
        .map(|c| c.as_slice().to_vec())
        .ok_or_else(|| CalError::InvalidParameter("singular smoothing system".to_string()))
}

fn polyval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

/// Linear interpolation over ascending `xs`, clamped at both ends.
pub fn interp_linear(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    let n = xs.len();
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[n - 1] {
        return ys[n - 1];
    }
    let hi = xs.partition_point(|&v| v < x).min(n - 1);
    let lo = hi - 1;
    let dx = xs[hi] - xs[lo];
    if dx <= 0.0 {
        return ys[lo];
    }
    ys[lo] + (ys[hi] - ys[lo]) * (x - xs[lo]) / dx
}

pub(crate) fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    if count < 2 {
        return vec![start];
    }
    let step = (end - start) / (count - 1) as f64;
    (0..count).map(|i| start + step * i as f64).collect()
}

pub(crate) fn logspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    linspace(start.log10(), end.log10(), count)
        .into_iter()
        .map(|e| 10f64.powf(e))
        .collect()
}

pub(crate) fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
    }
}

/// Matched plateau levels: parallel measured/calibration value sequences,
/// ordered by calibration magnitude in the configured direction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnchorPointSet {
    pub measured: Vec<f64>,
    pub calibration: Vec<f64>,
}

impl AnchorPointSet {
    /// Sorts the pairs by calibration value (descending when requested) and
    /// rejects duplicate calibration values: the fit direction would be
    /// ambiguous and the configuration has to change.
    pub fn new(
        measured: Vec<f64>,
        calibration: Vec<f64>,
        descending: bool,
    ) -> Result<Self, CalError> {
        if measured.len() != calibration.len() {
            return Err(CalError::DegenerateInput(format!(
                "anchor length mismatch: {} vs {}",
                measured.len(),
                calibration.len()
            )));
        }
        if measured.len() < 2 {
            return Err(CalError::DegenerateInput(format!(
                "need at least 2 anchors, got {}",
                measured.len()
            )));
        }
        let mut seen = HashSet::new();
        for &c in &calibration {
            if !seen.insert(OrderedFloat(c)) {
                return Err(CalError::AmbiguousAnchors(c));
            }
        }
        let mut order: Vec<usize> = (0..calibration.len()).collect();
        order.sort_by(|&a, &b| calibration[a].partial_cmp(&calibration[b]).unwrap());
        if descending {
            order.reverse();
        }
        Ok(Self {
            measured: order.iter().map(|&i| measured[i]).collect(),
            calibration: order.iter().map(|&i| calibration[i]).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.measured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measured.is_empty()
    }

    /// First measured anchor followed by consecutive measured differences;
    /// the fitter's starting parameter vector.
    pub fn initial_guess(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.measured.len());
        for (i, &d) in self.measured.iter().enumerate() {
            if i == 0 {
                out.push(d);
            } else {
                out.push(d - self.measured[i - 1]);
            }
        }
        out
    }

    /// Piecewise-linear measured-to-calibration map through the raw anchor
    /// pairs, clamped at the outermost anchors (the "initial guess" curve).
    pub fn linear_calibrated(&self, values: &[f64]) -> Vec<f64> {
        let mut pairs: Vec<(f64, f64)> = self
            .measured
            .iter()
            .copied()
            .zip(self.calibration.iter().copied())
            .collect();
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        let xs: Vec<f64> = pairs.iter().map(|p| p.0).collect();
        let ys: Vec<f64> = pairs.iter().map(|p| p.1).collect();
        values.iter().map(|&v| interp_linear(v, &xs, &ys)).collect()
    }
}

/// Flat parameter record consumed by the whole pipeline. Defaults mirror the
/// original instrument-software settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlignmentConfig {
    pub cal_window: Option<Window>,
    pub meas_window: Option<Window>,
    pub cal_flip: bool,
    pub meas_flip: bool,
    /// Derivative smoothing window (points) used by the grid aligner.
    pub filter_width: usize,
    pub filter_order: usize,
    /// Allowed stretch window in percent around 1.0.
    pub stretch_min_pct: f64,
    pub stretch_max_pct: f64,
    pub shift_resolution: usize,
    pub stretch_resolution: usize,
    /// Widen the shift search to the full calibration extent instead of the
    /// detected step extent.
    pub widen_search: bool,
    /// Number of grid candidates re-scored by the fine aligner.
    pub fine_candidates: usize,
    /// Number of plateaus in the reference staircase.
    pub step_count: usize,
    /// Minimum distance between staircase transitions, in position units.
    pub min_step_distance: f64,
    /// Optional smoothing width for step detection (0 = off).
    pub step_smooth_width: usize,
    pub include_left_edge: bool,
    pub include_right_edge: bool,
    /// Extra value-space anchors inserted per inter-plateau span.
    pub subdivisions: Vec<usize>,
    /// Caller-supplied calibration anchor values instead of automatic
    /// plateau detection.
    pub manual_anchors: Option<Vec<f64>>,
    pub dopant: Dopant,
    pub kind: CalibrationKind,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            cal_window: None,
            meas_window: None,
            cal_flip: false,
            meas_flip: false,
            filter_width: 3,
            filter_order: 1,
            stretch_min_pct: -5.0,
            stretch_max_pct: 5.0,
            shift_resolution: 1000,
            stretch_resolution: 1000,
            widen_search: false,
            fine_candidates: 50,
            step_count: 5,
            min_step_distance: 0.3,
            step_smooth_width: 0,
            include_left_edge: false,
            include_right_edge: false,
            subdivisions: vec![0, 0, 0, 0],
            manual_anchors: None,
            dopant: Dopant::Boron,
            kind: CalibrationKind::Resistivity,
        }
    }
}

/// Pipeline progress, advanced only by the session methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    NotStarted,
    Imported,
    RoughAligned,
    FineAligned,
    Fitted,
}

/// Drives the pipeline over one immutable profile pair. Every stage consumes
/// the previous stage's result explicitly; a failed stage leaves earlier
/// results untouched.
pub struct AlignmentSession {
    config: AlignmentConfig,
    cal: Option<Profile>,
    meas: Option<Profile>,
    step_positions: Option<Vec<f64>>,
    rough: Option<GridSearch>,
    fine: Option<FineSearch>,
    fitted: Option<FittedCalibration>,
}

impl AlignmentSession {
    pub fn new(config: AlignmentConfig) -> Self {
        Self {
            config,
            cal: None,
            meas: None,
            step_positions: None,
            rough: None,
            fine: None,
            fitted: None,
        }
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        if self.fitted.is_some() {
            Stage::Fitted
        } else if self.fine.is_some() {
            Stage::FineAligned
        } else if self.rough.is_some() {
            Stage::RoughAligned
        } else if self.cal.is_some() && self.meas.is_some() {
            Stage::Imported
        } else {
            Stage::NotStarted
        }
    }

    /// Store the profile pair after applying the configured borders and flip
    /// state. Resets all downstream results.
    pub fn import_profiles(&mut self, cal: Profile, meas: Profile) {
        self.cal = Some(apply_import(cal, self.config.cal_window, self.config.cal_flip));
        self.meas = Some(apply_import(
            meas,
            self.config.meas_window,
            self.config.meas_flip,
        ));
        self.step_positions = None;
        self.rough = None;
        self.fine = None;
        self.fitted = None;
    }

    pub fn calibration(&self) -> Option<&Profile> {
        self.cal.as_ref()
    }

    pub fn measurement(&self) -> Option<&Profile> {
        self.meas.as_ref()
    }

    pub fn step_positions(&self) -> Option<&[f64]> {
        self.step_positions.as_deref()
    }

    pub fn rough(&self) -> Option<&GridSearch> {
        self.rough.as_ref()
    }

    pub fn fine(&self) -> Option<&FineSearch> {
        self.fine.as_ref()
    }

    pub fn fitted(&self) -> Option<&FittedCalibration> {
        self.fitted.as_ref()
    }

    fn profiles(&self) -> Result<(&Profile, &Profile), CalError> {
        match (self.cal.as_ref(), self.meas.as_ref()) {
            (Some(c), Some(m)) => Ok((c, m)),
            _ => Err(CalError::DegenerateInput(
                "profiles have not been imported".to_string(),
            )),
        }
    }

    /// Detect the staircase transitions and run the coarse grid search.
    pub fn rough_align(&mut self) -> Result<&GridSearch, CalError> {
        let (cal, meas) = self.profiles()?;
        let transitions = self.config.step_count.saturating_sub(1);
        let steps = steps::detect_steps(
            cal,
            transitions,
            self.config.min_step_distance,
            self.config.step_smooth_width,
        )?
        .ok_or_else(|| {
            CalError::DegenerateInput("calibration profile has zero position span".to_string())
        })?;
        let grid = align::grid_align(&steps, cal, meas, &self.config)?;
        self.step_positions = Some(steps);
        self.rough = Some(grid);
        self.fine = None;
        self.fitted = None;
        Ok(self.rough.as_ref().unwrap())
    }

    /// Re-score the best grid candidates with the spline-continuity cost.
    pub fn fine_align(&mut self) -> Result<&FineSearch, CalError> {
        let (cal, meas) = self.profiles()?;
        let steps = self.step_positions.as_deref().ok_or_else(|| {
            CalError::DegenerateInput("rough alignment has not been run".to_string())
        })?;
        let grid = self.rough.as_ref().ok_or_else(|| {
            CalError::DegenerateInput("rough alignment has not been run".to_string())
        })?;
        let fine = align::fine_align(grid, steps, cal, meas, &self.config)?;
        self.fine = Some(fine);
        self.fitted = None;
        Ok(self.fine.as_ref().unwrap())
    }

    /// Build the anchor set at the refined transform and fit the calibration
    /// model. On failure, any previously fitted model is left untouched.
    pub fn fit(&mut self) -> Result<&FittedCalibration, CalError> {
        let (cal, meas) = self.profiles()?;
        let steps = self.step_positions.as_deref().ok_or_else(|| {
            CalError::DegenerateInput("rough alignment has not been run".to_string())
        })?;
        let tr = self
            .fine
            .as_ref()
            .map(|f| f.transform)
            .ok_or_else(|| {
                CalError::DegenerateInput("fine alignment has not been run".to_string())
            })?;

        let cal_t = cal.transformed(tr);
        let (cal_c, meas_c) = common_range_trim(&cal_t, meas)?;

        let anchors = match &self.config.manual_anchors {
            Some(values) => steps::manual_anchor_set(&cal_c, &meas_c, values, &self.config.kind)?,
            None => {
                let lo = cal_c.x_min();
                let hi = cal_c.x_max();
                let steps_t: Vec<f64> = steps
                    .iter()
                    .map(|&s| tr.apply(s))
                    .filter(|&s| s >= lo && s <= hi)
                    .collect();
                let opts = PlateauOptions {
                    include_left_edge: self.config.include_left_edge,
                    include_right_edge: self.config.include_right_edge,
                    subdivisions: self.config.subdivisions.clone(),
                };
                steps::estimate_anchors(&cal_c, &meas_c, &steps_t, &opts, &self.config.kind)?
            }
        };

        let counterparts = measured_counterparts(&cal_c, &meas_c);
        let fitted = fit::fit_calibration(&anchors, &counterparts, cal_c.ys())?;
        self.fitted = Some(fitted);
        Ok(self.fitted.as_ref().unwrap())
    }

    /// Matched (measured counterpart, calibration value) pairs over the
    /// trimmed common range at the refined transform.
    pub fn matched_pairs(&self) -> Result<Vec<(f64, f64)>, CalError> {
        let (cal, meas) = self.profiles()?;
        let tr = self
            .fine
            .as_ref()
            .map(|f| f.transform)
            .ok_or_else(|| {
                CalError::DegenerateInput("fine alignment has not been run".to_string())
            })?;
        let cal_t = cal.transformed(tr);
        let (cal_c, meas_c) = common_range_trim(&cal_t, meas)?;
        let counterparts = measured_counterparts(&cal_c, &meas_c);
        Ok(counterparts
            .into_iter()
            .zip(cal_c.ys().iter().copied())
            .collect())
    }

    /// Assemble the persisted calibration record. `concentration_anchors`
    /// carries physically converted anchor values when the caller has run the
    /// conversion (resistivity mode only).
    pub fn record(
        &self,
        sample: &str,
        data_path: &str,
        concentration_anchors: Option<Vec<f64>>,
    ) -> Result<CalibrationRecord, CalError> {
        let fitted = self.fitted.as_ref().ok_or_else(|| {
            CalError::DegenerateInput("calibration has not been fitted".to_string())
        })?;
        let rough = self.rough.as_ref().ok_or_else(|| {
            CalError::DegenerateInput("rough alignment has not been run".to_string())
        })?;
        let matched = self.matched_pairs()?;

        let cal_anchors = fitted.anchors.calibration.clone();
        let (res, cc) = match self.config.kind {
            CalibrationKind::ChargeCarrier => (None, Some(cal_anchors)),
            CalibrationKind::Resistivity => (Some(cal_anchors), concentration_anchors),
            CalibrationKind::Custom(_) => (Some(cal_anchors), None),
        };

        Ok(CalibrationRecord {
            version: RECORD_VERSION.to_string(),
            ident: CalibrationRecord::ident_for(data_path, Utc::now()),
            sample: sample.to_string(),
            dopant: self.config.dopant,
            carrier: self.config.dopant.carrier_label().to_string(),
            kind: self.config.kind.clone(),
            matched,
            quality: rough.best_quality,
            initial_guess: fitted.initial_guess.clone(),
            resistivity_anchors: res,
            concentration_anchors: cc,
            fitted_anchors: fitted.fitted_measured.clone(),
        })
    }
}

fn apply_import(profile: Profile, window: Option<Window>, flipped: bool) -> Profile {
    match window {
        Some(w) => profile.crop(w, flipped),
        None if flipped => profile.flipped(),
        None => profile,
    }
}

/// Measured value at each calibration sample position (nearest-position
/// lookup in the measurement profile).
pub fn measured_counterparts(cal: &Profile, meas: &Profile) -> Vec<f64> {
    let mut pairs: Vec<(f64, f64)> = meas
        .xs()
        .iter()
        .copied()
        .zip(meas.ys().iter().copied())
        .collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    cal.xs()
        .iter()
        .map(|&p| {
            let hi = pairs.partition_point(|&(x, _)| x < p);
            if hi == 0 {
                pairs[0].1
            } else if hi == pairs.len() {
                pairs[pairs.len() - 1].1
            } else {
                let left = pairs[hi - 1];
                let right = pairs[hi];
                if (p - left.0).abs() <= (right.0 - p).abs() {
                    left.1
                } else {
                    right.1
                }
            }
        })
        .collect()
}

pub const RECORD_VERSION: &str = "v0.5";

/// Opaque bundle persisted for the append-only calibration database,
/// versioned by a string tag to allow schema evolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub version: String,
    pub ident: String,
    pub sample: String,
    pub dopant: Dopant,
    pub carrier: String,
    pub kind: CalibrationKind,
    /// Matched-and-cropped (measured counterpart, calibration value) pairs.
    pub matched: Vec<(f64, f64)>,
    pub quality: f64,
    pub initial_guess: Vec<f64>,
    pub resistivity_anchors: Option<Vec<f64>>,
    pub concentration_anchors: Option<Vec<f64>>,
    pub fitted_anchors: Vec<f64>,
}

impl CalibrationRecord {
    pub fn ident_for(data_path: &str, at: DateTime<Utc>) -> String {
        format!("{}F{}", at.format("%d/%m/%Y %H:%M"), data_path)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_profile() -> Profile {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = (0..10).map(|i| 2.0 * i as f64 + 1.0).collect();
        Profile::new(x, y).unwrap()
    }

    #[test]
    fn profile_rejects_degenerate_input() {
        assert!(matches!(
            Profile::new(vec![0.0], vec![1.0]),
            Err(CalError::DegenerateInput(_))
        ));
        assert!(matches!(
            Profile::new(vec![0.0, 1.0], vec![1.0, f64::NAN]),
            Err(CalError::DegenerateInput(_))
        ));
        assert!(matches!(
            Profile::new(vec![0.0, 1.0, 2.0], vec![1.0, 2.0]),
            Err(CalError::DegenerateInput(_))
        ));
    }

    #[test]
    fn crop_full_range_and_double_flip_is_identity() {
        let p = ramp_profile();
        let window = Window::new(p.x_first(), p.x_last());
        let cropped = p.crop(window, false);
        assert_eq!(cropped.xs(), p.xs());
        assert_eq!(cropped.ys(), p.ys());

        let back = p.crop(window, true).flipped();
        assert_eq!(back.xs(), p.xs());
        assert_eq!(back.ys(), p.ys());
    }

    #[test]
    fn crop_without_matches_is_a_noop() {
        let p = ramp_profile();
        let cropped = p.crop(Window::new(100.0, 200.0), true);
        assert_eq!(cropped.xs(), p.xs());
        assert_eq!(cropped.ys(), p.ys());
    }

    #[test]
    fn crop_handles_reversed_window() {
        let p = ramp_profile();
        let cropped = p.crop(Window::new(6.0, 2.0), false);
        assert_eq!(cropped.xs(), &[2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn nearest_index_breaks_ties_to_first() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let (i, v) = nearest_index(&xs, 1.5);
        assert_eq!(i, 1);
        assert_eq!(v, 1.0);
        let (i, _) = nearest_index(&xs, 2.2);
        assert_eq!(i, 2);
    }

    #[test]
    fn common_range_trim_overlap() {
        let cal = Profile::new(
            (0..20).map(|i| i as f64).collect(),
            (0..20).map(|i| i as f64).collect(),
        )
        .unwrap();
        let meas = Profile::new(
            (5..30).map(|i| i as f64).collect(),
            (5..30).map(|i| i as f64).collect(),
        )
        .unwrap();
        let (cal_t, meas_t) = common_range_trim(&cal, &meas).unwrap();
        assert_eq!(cal_t.x_first(), 5.0);
        assert_eq!(cal_t.x_last(), 19.0);
        assert_eq!(meas_t.x_first(), 5.0);
        assert_eq!(meas_t.x_last(), 19.0);
    }

    #[test]
    fn savgol_preserves_linear_data() {
        let y: Vec<f64> = (0..20).map(|i| 0.5 * i as f64 - 3.0).collect();
        let sm = savgol_filter(&y, 5, 1).unwrap();
        for (a, b) in y.iter().zip(sm.iter()) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn savgol_rejects_bad_window() {
        let y = vec![1.0, 2.0, 3.0, 4.0];
        assert!(matches!(
            savgol_filter(&y, 4, 1),
            Err(CalError::InvalidParameter(_))
        ));
        assert!(matches!(
            savgol_filter(&y, 5, 1),
            Err(CalError::InvalidParameter(_))
        ));
        assert!(matches!(
            savgol_filter(&y, 3, 3),
            Err(CalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn interp_linear_clamps_at_ends() {
        let xs = [0.0, 1.0, 2.0];
        let ys = [0.0, 10.0, 20.0];
        assert_eq!(interp_linear(-1.0, &xs, &ys), 0.0);
        assert_eq!(interp_linear(3.0, &xs, &ys), 20.0);
        assert!((interp_linear(0.5, &xs, &ys) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn anchors_sort_by_direction() {
        let set = AnchorPointSet::new(vec![1.0, 2.0, 3.0], vec![10.0, 30.0, 20.0], false).unwrap();
        assert_eq!(set.calibration, vec![10.0, 20.0, 30.0]);
        assert_eq!(set.measured, vec![1.0, 3.0, 2.0]);

        let set = AnchorPointSet::new(vec![1.0, 2.0, 3.0], vec![10.0, 30.0, 20.0], true).unwrap();
        assert_eq!(set.calibration, vec![30.0, 20.0, 10.0]);
        assert_eq!(set.measured, vec![2.0, 3.0, 1.0]);
    }

    #[test]
    fn duplicate_anchor_values_are_ambiguous() {
        let err = AnchorPointSet::new(vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 10.0], false)
            .unwrap_err();
        assert!(matches!(err, CalError::AmbiguousAnchors(v) if v == 10.0));
    }

    #[test]
    fn initial_guess_is_first_value_then_differences() {
        let set = AnchorPointSet::new(vec![4.0, 6.0, 9.0], vec![1.0, 2.0, 3.0], false).unwrap();
        assert_eq!(set.initial_guess(), vec![4.0, 2.0, 3.0]);
    }

    #[test]
    fn linear_calibrated_interpolates_between_anchors() {
        let set = AnchorPointSet::new(vec![4.0, 6.0, 9.0], vec![1.0, 2.0, 3.0], false).unwrap();
        let out = set.linear_calibrated(&[4.0, 5.0, 9.0, 20.0]);
        assert!((out[0] - 1.0).abs() < 1e-12);
        assert!((out[1] - 1.5).abs() < 1e-12);
        assert!((out[2] - 3.0).abs() < 1e-12);
        // Clamped past the outermost anchor.
        assert!((out[3] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn config_json_round_trip() {
        let cfg = AlignmentConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: AlignmentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_count, cfg.step_count);
        assert_eq!(back.kind, cfg.kind);
        assert_eq!(back.subdivisions, cfg.subdivisions);
    }

    #[test]
    fn record_ident_format() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(
            CalibrationRecord::ident_for("/data/run1.txt", at),
            "09/03/2024 14:05F/data/run1.txt"
        );
    }

    #[test]
    fn session_stage_progression() {
        let cfg = AlignmentConfig::default();
        let mut session = AlignmentSession::new(cfg);
        assert_eq!(session.stage(), Stage::NotStarted);
        assert!(session.rough_align().is_err());

        let cal = ramp_profile();
        let meas = ramp_profile();
        session.import_profiles(cal, meas);
        assert_eq!(session.stage(), Stage::Imported);
        assert!(session.fine_align().is_err());
        assert!(session.fit().is_err());
    }
}
