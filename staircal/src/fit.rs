//! Constrained fit of the smooth monotone calibration curve.
//!
//! The model is a smooth approximation of a piecewise-linear monotone step
//! function: anchor boundaries in measured space are a chain of cumulative
//! signed offsets, each segment contributes a linear ramp gated by a steep
//! hyperbolic-tangent window, and the gates telescope to a partition of
//! unity.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::{AnchorPointSet, CalError};

/// Gate steepness relative to the mean boundary spacing.
const GATE_GAIN: f64 = 12.0;
const LM_MAX_ITER: usize = 200;
const LM_TOL: f64 = 1e-10;
const LM_LAMBDA_MAX: f64 = 1e12;

/// Fitted calibration function mapping measured values to calibration
/// values. Re-parametrisable with a substituted target list without
/// refitting.
#[derive(Clone, Debug)]
pub struct CalibrationModel {
    /// Anchor boundaries in measured space, ascending.
    boundaries: Vec<f64>,
    /// Calibration value per boundary, same order as `boundaries`.
    targets: Vec<f64>,
    kappa: f64,
    /// True when the anchor chain ran high-to-low in measured space.
    reversed: bool,
}

impl CalibrationModel {
    /// Build the model from the offset parameter vector and the anchor
    /// calibration values (both in anchor order). The global sign of the
    /// non-first offsets fixes a single monotonic direction.
    pub fn from_offsets(offsets: &[f64], targets: &[f64]) -> Result<Self, CalError> {
        if offsets.len() != targets.len() {
            return Err(CalError::DegenerateInput(format!(
                "offset/target length mismatch: {} vs {}",
                offsets.len(),
                targets.len()
            )));
        }
        if offsets.len() < 2 {
            return Err(CalError::DegenerateInput(format!(
                "model needs at least 2 anchors, got {}",
                offsets.len()
            )));
        }
        let bounds = cumulative_boundaries(offsets);
        let n = bounds.len();
        let reversed = bounds[n - 1] < bounds[0];
        let (boundaries, targets) = if reversed {
            let mut b = bounds;
            let mut t = targets.to_vec();
            b.reverse();
            t.reverse();
            (b, t)
        } else {
            (bounds, targets.to_vec())
        };
        let mean_spacing = (boundaries[n - 1] - boundaries[0]) / (n - 1) as f64;
        if !(mean_spacing > 0.0) {
            return Err(CalError::DegenerateInput(
                "anchor boundaries collapse to a point".to_string(),
            ));
        }
        Ok(Self {
            boundaries,
            targets,
            kappa: GATE_GAIN / mean_spacing,
            reversed,
        })
    }

    /// Boundaries in the original anchor order.
    pub fn anchor_boundaries(&self) -> Vec<f64> {
        let mut b = self.boundaries.clone();
        if self.reversed {
            b.reverse();
        }
        b
    }

    /// Same boundaries and gates, different target values (in anchor
    /// order) -- used to re-apply the fit to physically converted anchors.
    pub fn with_targets(&self, targets: &[f64]) -> Result<CalibrationModel, CalError> {
        if targets.len() != self.targets.len() {
            return Err(CalError::DegenerateInput(format!(
                "target length mismatch: {} vs {}",
                targets.len(),
                self.targets.len()
            )));
        }
        let mut t = targets.to_vec();
        if self.reversed {
            t.reverse();
        }
        Ok(Self {
            boundaries: self.boundaries.clone(),
            targets: t,
            kappa: self.kappa,
            reversed: self.reversed,
        })
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let b = &self.boundaries;
        let c = &self.targets;
        let k = self.kappa;
        let n = b.len();
        let mut acc = 0.0;
        for i in 0..n - 1 {
            let h = (b[i + 1] - b[i]).max(1e-12);
            let ramp = c[i] + (c[i + 1] - c[i]) * (x - b[i]) / h;
            let gate = if n == 2 {
                1.0
            } else if i == 0 {
                // Half-open end gates extrapolate past the outer anchors.
                0.5 * (1.0 - (k * (x - b[1])).tanh())
            } else if i == n - 2 {
                0.5 * (1.0 + (k * (x - b[n - 2])).tanh())
            } else {
                0.5 * ((k * (x - b[i])).tanh() - (k * (x - b[i + 1])).tanh())
            };
            acc += gate * ramp;
        }
        acc
    }

    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|&v| self.evaluate(v)).collect()
    }

    /// Apply the calibration to a 2-D field of raw values; same shape out.
    pub fn apply_field(&self, field: &Array2<f64>) -> Array2<f64> {
        field.mapv(|v| self.evaluate(v))
    }
}

/// Offsets accumulated into boundary positions: the first is absolute, the
/// rest add `sign * |offset|` with one global sign.
pub(crate) fn cumulative_boundaries(offsets: &[f64]) -> Vec<f64> {
    let sign = {
        let s = offsets[1..].iter().sum::<f64>().signum();
        if s == 0.0 {
            1.0
        } else {
            s
        }
    };
    let mut out = Vec::with_capacity(offsets.len());
    let mut acc = 0.0;
    for (i, &o) in offsets.iter().enumerate() {
        if i == 0 {
            acc = o;
        } else {
            acc += sign * o.abs();
        }
        out.push(acc);
    }
    out
}

/// Result of a converged calibration fit.
#[derive(Clone, Debug)]
pub struct FittedCalibration {
    pub model: CalibrationModel,
    pub anchors: AnchorPointSet,
    pub initial_guess: Vec<f64>,
    /// Fitted offset parameter vector.
    pub offsets: Vec<f64>,
    /// Cumulative fitted anchor values in anchor order.
    pub fitted_measured: Vec<f64>,
    pub residual_norm: f64,
}

/// Nonlinear least-squares fit of the anchor offsets against the entire
/// calibration profile. `measured_at_cal[j]` is the measured counterpart of
/// calibration sample `cal_values[j]`. Divergence is a hard error and no
/// partial result is produced.
pub fn fit_calibration(
    anchors: &AnchorPointSet,
    measured_at_cal: &[f64],
    cal_values: &[f64],
) -> Result<FittedCalibration, CalError> {
    if measured_at_cal.len() != cal_values.len() {
        return Err(CalError::DegenerateInput(format!(
            "sample length mismatch: {} vs {}",
            measured_at_cal.len(),
            cal_values.len()
        )));
    }
    if measured_at_cal.len() < anchors.len() {
        return Err(CalError::DegenerateInput(
            "fewer profile samples than anchors".to_string(),
        ));
    }

    let targets = anchors.calibration.clone();
    let residuals = |theta: &[f64]| -> Result<Vec<f64>, CalError> {
        let model = CalibrationModel::from_offsets(theta, &targets)?;
        Ok(measured_at_cal
            .iter()
            .zip(cal_values.iter())
            .map(|(&u, &v)| model.evaluate(u) - v)
            .collect())
    };

    let initial = anchors.initial_guess();
    let offsets = levenberg_marquardt(&residuals, &initial)?;
    let model = CalibrationModel::from_offsets(&offsets, &anchors.calibration)?;
    let fitted_measured = cumulative_boundaries(&offsets);
    let final_residuals = residuals(&offsets)?;
    Ok(FittedCalibration {
        model,
        anchors: anchors.clone(),
        initial_guess: initial,
        offsets,
        fitted_measured,
        residual_norm: sumsq(&final_residuals).sqrt(),
    })
}

fn sumsq(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

/// Damped Gauss-Newton with a forward-difference Jacobian. Trial parameters
/// that make the model degenerate count as uphill steps.
fn levenberg_marquardt<F>(f: &F, p0: &[f64]) -> Result<Vec<f64>, CalError>
where
    F: Fn(&[f64]) -> Result<Vec<f64>, CalError>,
{
    let mut p = p0.to_vec();
    let mut r = f(&p)?;
    let mut cost = sumsq(&r);
    if !cost.is_finite() {
        return Err(CalError::FitDivergence(
            "non-finite residuals at the initial guess".to_string(),
        ));
    }
    let mut lambda = 1e-3;

    for _ in 0..LM_MAX_ITER {
        if cost <= LM_TOL {
            return Ok(p);
        }
        let jac = numeric_jacobian(f, &p, &r)?;
        let jt = jac.transpose();
        let jtj = &jt * &jac;
        let jtr = &jt * DVector::from_column_slice(&r);
        let grad_norm = jtr.norm();
        if grad_norm <= 1e-12 * (1.0 + cost) {
            return Ok(p);
        }
        let rhs = -&jtr;

        let mut stepped = false;
        while lambda <= LM_LAMBDA_MAX {
            let mut damped = jtj.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(delta) = damped.lu().solve(&rhs) else {
                lambda *= 10.0;
                continue;
            };
            let trial: Vec<f64> = p.iter().zip(delta.iter()).map(|(pi, di)| pi + di).collect();
            let Ok(trial_r) = f(&trial) else {
                lambda *= 10.0;
                continue;
            };
            let trial_cost = sumsq(&trial_r);
            if trial_cost.is_finite() && trial_cost < cost {
                let improvement = cost - trial_cost;
                p = trial;
                r = trial_r;
                cost = trial_cost;
                lambda = (lambda * 0.1).max(1e-12);
                stepped = true;
                if improvement <= LM_TOL * cost.max(LM_TOL) {
                    return Ok(p);
                }
                break;
            }
            lambda *= 10.0;
        }

        if !stepped {
            // No downhill step at any damping: the step size has collapsed,
            // which is convergence in the step-tolerance sense.
            return Ok(p);
        }
    }
    Err(CalError::FitDivergence(format!(
        "iteration limit reached at cost {cost:.3e}"
    )))
}

fn numeric_jacobian<F>(f: &F, p: &[f64], r0: &[f64]) -> Result<DMatrix<f64>, CalError>
where
    F: Fn(&[f64]) -> Result<Vec<f64>, CalError>,
{
    let rows = r0.len();
    let cols = p.len();
    let mut jac = DMatrix::zeros(rows, cols);
    for c in 0..cols {
        let h = 1e-6 * p[c].abs().max(1e-3);
        let mut shifted = p.to_vec();
        shifted[c] += h;
        let rc = f(&shifted)?;
        for row in 0..rows {
            jac[(row, c)] = (rc[row] - r0[row]) / h;
        }
    }
    Ok(jac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AlignmentConfig, AlignmentSession, AnchorPointSet, CalibrationKind, Profile, Stage,
    };

    #[test]
    fn gates_partition_unity() {
        let model =
            CalibrationModel::from_offsets(&[0.5, 0.8, 0.6, 0.7], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        // Constant targets collapse every ramp to the same constant; the
        // model reproduces it everywhere only if the gates sum to one.
        let flat = model.with_targets(&[2.5, 2.5, 2.5, 2.5]).unwrap();
        for i in 0..50 {
            let x = -1.0 + i as f64 * 0.1;
            assert!((flat.evaluate(x) - 2.5).abs() < 1e-9, "x = {x}");
        }
    }

    #[test]
    fn model_interpolates_anchors() {
        let offsets = [0.5, 0.8, 0.6, 0.7];
        let targets = [1.0, 2.0, 3.0, 4.0];
        let model = CalibrationModel::from_offsets(&offsets, &targets).unwrap();
        let bounds = cumulative_boundaries(&offsets);
        for (b, t) in bounds.iter().zip(targets.iter()) {
            assert!(
                (model.evaluate(*b) - t).abs() < 1e-3,
                "f({b}) = {} vs {t}",
                model.evaluate(*b)
            );
        }
    }

    #[test]
    fn global_sign_forces_one_direction() {
        // Mixed-sign offsets still yield a monotone boundary chain.
        let offsets = [5.0, -1.0, 1.2, -0.8];
        let bounds = cumulative_boundaries(&offsets);
        for (got, want) in bounds.iter().zip([5.0, 4.0, 2.8, 2.0].iter()) {
            assert!((got - want).abs() < 1e-12, "{got} vs {want}");
        }
        let model = CalibrationModel::from_offsets(&offsets, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        // Descending measured chain maps low measured values to high targets.
        assert!(model.evaluate(5.0) < model.evaluate(2.0));
    }

    #[test]
    fn fit_recovers_exact_offsets_on_noiseless_profile() {
        let true_offsets = [0.5, 0.8, 0.6, 0.7];
        let targets = [1.0, 2.0, 3.0, 4.0];
        let truth = CalibrationModel::from_offsets(&true_offsets, &targets).unwrap();
        let bounds = cumulative_boundaries(&true_offsets);

        // The calibration profile is a perfect noiseless instance of the
        // model, sampled densely over the measured range.
        let u: Vec<f64> = (0..240).map(|i| 0.2 + i as f64 * 0.0125).collect();
        let v: Vec<f64> = u.iter().map(|&x| truth.evaluate(x)).collect();

        // Perturbed measured anchors so the solver has work to do.
        let measured: Vec<f64> = bounds.iter().enumerate()
            .map(|(i, &b)| b + if i % 2 == 0 { 0.04 } else { -0.03 })
            .collect();
        let anchors = AnchorPointSet::new(measured, targets.to_vec(), false).unwrap();

        let fitted = fit_calibration(&anchors, &u, &v).unwrap();
        for (a, b) in fitted.fitted_measured.iter().zip(bounds.iter()) {
            assert!((a - b).abs() < 1e-4, "boundary {a} vs {b}");
        }
        // The model at the true measurement anchors reproduces the
        // calibration anchors.
        for (b, t) in bounds.iter().zip(targets.iter()) {
            assert!((fitted.model.evaluate(*b) - t).abs() < 1e-3);
        }
        assert!(fitted.residual_norm < 1e-4);
    }

    #[test]
    fn fit_rejects_mismatched_samples() {
        let anchors =
            AnchorPointSet::new(vec![1.0, 2.0], vec![10.0, 20.0], false).unwrap();
        assert!(fit_calibration(&anchors, &[1.0, 2.0], &[1.0]).is_err());
        assert!(fit_calibration(&anchors, &[1.0], &[1.0]).is_err());
    }

    #[test]
    fn retargeted_model_applies_to_fields() {
        let model =
            CalibrationModel::from_offsets(&[0.5, 0.8, 0.6], &[1.0, 2.0, 3.0]).unwrap();
        let converted = model.with_targets(&[10.0, 20.0, 30.0]).unwrap();
        let field = Array2::from_shape_fn((3, 4), |(r, c)| 0.3 + 0.2 * (r * 4 + c) as f64);
        let out = converted.apply_field(&field);
        assert_eq!(out.shape(), field.shape());
        // Re-targeting scales the output decade up without refitting.
        for (a, b) in out.iter().zip(model.apply_field(&field).iter()) {
            assert!((a - 10.0 * b).abs() < 1e-6);
        }
    }

    fn staircase_level(x: f64) -> f64 {
        (x / 2.0).floor().clamp(0.0, 4.0)
    }

    #[test]
    fn session_pipeline_end_to_end() {
        let m0 = 1.01;
        let t0 = 0.4;
        let cal_x: Vec<f64> = (0..100).map(|i| i as f64 * 0.1).collect();
        let cal_y: Vec<f64> = cal_x.iter().map(|&x| staircase_level(x) + 1.0).collect();
        let cal = Profile::new(cal_x, cal_y).unwrap();

        // Measurement reads half the calibration value plus an offset.
        let meas_x: Vec<f64> = (0..260).map(|i| i as f64 * 0.05 - 0.5).collect();
        let meas_y: Vec<f64> = meas_x
            .iter()
            .map(|&x| {
                0.5 * (staircase_level((x - t0) / m0) + 1.0) + 0.3 + 0.002 * (x * 23.7).sin()
            })
            .collect();
        let meas = Profile::new(meas_x, meas_y).unwrap();

        let cfg = AlignmentConfig {
            stretch_resolution: 21,
            shift_resolution: 201,
            fine_candidates: 25,
            kind: CalibrationKind::Resistivity,
            ..Default::default()
        };
        let mut session = AlignmentSession::new(cfg);
        session.import_profiles(cal, meas);
        assert_eq!(session.stage(), Stage::Imported);

        session.rough_align().unwrap();
        assert_eq!(session.stage(), Stage::RoughAligned);
        session.fine_align().unwrap();
        assert_eq!(session.stage(), Stage::FineAligned);
        let fitted = session.fit().unwrap().clone();
        assert_eq!(session.stage(), Stage::Fitted);

        // The fitted curve maps measured plateau levels back to calibration
        // plateau values.
        for (u, c) in fitted
            .anchors
            .measured
            .iter()
            .zip(fitted.anchors.calibration.iter())
        {
            let got = fitted.model.evaluate(*u);
            assert!((got - c).abs() < 0.2, "f({u}) = {got}, expected {c}");
        }

        let record = session.record("ref-sample", "/tmp/meas.txt", None).unwrap();
        assert_eq!(record.version, crate::RECORD_VERSION);
        assert!(record.resistivity_anchors.is_some());
        assert!(record.concentration_anchors.is_none());
        assert_eq!(record.fitted_anchors.len(), fitted.anchors.len());
        assert!(record.quality > 0.0);
    }
}
