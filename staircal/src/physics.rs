//! Closed-form Masetti mobility model: resistivity from carrier
//! concentration, and a bounded inverse lookup.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{interp_linear, logspace, CalError};

pub const ELECTRON_CHARGE: f64 = 1.6e-19;
/// Physically modeled concentration range [cm^-3]; inverse lookups clamp to
/// the resistivities of these bounds.
pub const N_RANGE: (f64, f64) = (1e14, 1e22);
const LOOKUP_POINTS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dopant {
    Arsenic,
    Phosphorus,
    Boron,
}

impl Dopant {
    pub fn symbol(&self) -> &'static str {
        match self {
            Dopant::Arsenic => "As",
            Dopant::Phosphorus => "P",
            Dopant::Boron => "B",
        }
    }

    pub fn carrier_label(&self) -> &'static str {
        match self {
            Dopant::Boron => "p-type",
            _ => "n-type",
        }
    }
}

impl FromStr for Dopant {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "As" => Ok(Dopant::Arsenic),
            "P" => Ok(Dopant::Phosphorus),
            "B" => Ok(Dopant::Boron),
            other => Err(CalError::UnknownDopant(other.to_string())),
        }
    }
}

struct MasettiParams {
    mu_0: f64,
    mu_max: f64,
    mu_1: f64,
    c_r: f64,
    c_s: f64,
    alpha: f64,
    beta: f64,
}

fn masetti_params(dopant: Dopant) -> MasettiParams {
    match dopant {
        Dopant::Arsenic => MasettiParams {
            mu_0: 52.2,
            mu_max: 1417.0,
            mu_1: 43.4,
            c_r: 9.68e16,
            c_s: 3.43e20,
            alpha: 0.680,
            beta: 2.00,
        },
        Dopant::Phosphorus => MasettiParams {
            mu_0: 68.5,
            mu_max: 1414.0,
            mu_1: 56.1,
            c_r: 9.20e16,
            c_s: 3.41e20,
            alpha: 0.711,
            beta: 1.98,
        },
        Dopant::Boron => MasettiParams {
            mu_0: 44.9,
            mu_max: 470.5,
            mu_1: 29.0,
            c_r: 2.23e17,
            c_s: 6.1e20,
            alpha: 0.719,
            beta: 2.00,
        },
    }
}

/// Carrier mobility [cm^2/Vs] at concentration `n` [cm^-3].
pub fn mobility_masetti(n: f64, dopant: Dopant) -> f64 {
    let p = masetti_params(dopant);
    match dopant {
        Dopant::Boron => {
            const P_C: f64 = 9.23e16;
            p.mu_0 * (-P_C / n).exp() + p.mu_max / (1.0 + (n / p.c_r).powf(p.alpha))
                - p.mu_1 / (1.0 + (p.c_s / n).powf(p.beta))
        }
        _ => {
            p.mu_0 + (p.mu_max - p.mu_0) / (1.0 + (n / p.c_r).powf(p.alpha))
                - p.mu_1 / (1.0 + (p.c_s / n).powf(p.beta))
        }
    }
}

/// Resistivity [Ohm cm] of silicon doped to concentration `n` [cm^-3].
pub fn concentration_to_resistivity(n: f64, dopant: Dopant) -> f64 {
    1.0 / (n * mobility_masetti(n, dopant) * ELECTRON_CHARGE)
}

/// Inverse conversion via a monotone lookup table over a wide concentration
/// range. Resistivities outside the modeled interval clamp to its edges
/// rather than extrapolating.
pub fn resistivity_to_concentration(rho: &[f64], dopant: Dopant) -> Vec<f64> {
    let n_grid = logspace(0.5 * N_RANGE.0, 2.0 * N_RANGE.1, LOOKUP_POINTS);
    // Resistivity decreases with concentration; reverse both for an
    // ascending interpolation axis.
    let mut rho_grid: Vec<f64> = n_grid
        .iter()
        .map(|&n| concentration_to_resistivity(n, dopant))
        .collect();
    let mut n_axis = n_grid;
    rho_grid.reverse();
    n_axis.reverse();

    let rho_hi = concentration_to_resistivity(N_RANGE.0, dopant);
    let rho_lo = concentration_to_resistivity(N_RANGE.1, dopant);
    rho.iter()
        .map(|&r| {
            let clamped = r.clamp(rho_lo, rho_hi);
            interp_linear(clamped, &rho_grid, &n_axis)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dopant_parsing() {
        assert_eq!("As".parse::<Dopant>().unwrap(), Dopant::Arsenic);
        assert_eq!("P".parse::<Dopant>().unwrap(), Dopant::Phosphorus);
        assert_eq!("B".parse::<Dopant>().unwrap(), Dopant::Boron);
        assert!(matches!(
            "Ga".parse::<Dopant>(),
            Err(CalError::UnknownDopant(_))
        ));
    }

    #[test]
    fn carrier_labels() {
        assert_eq!(Dopant::Boron.carrier_label(), "p-type");
        assert_eq!(Dopant::Phosphorus.carrier_label(), "n-type");
        assert_eq!(Dopant::Arsenic.carrier_label(), "n-type");
    }

    #[test]
    fn mobility_is_positive_and_decreasing_at_high_doping() {
        for dopant in [Dopant::Arsenic, Dopant::Phosphorus, Dopant::Boron] {
            let low = mobility_masetti(1e15, dopant);
            let high = mobility_masetti(1e20, dopant);
            assert!(low > 0.0 && high > 0.0);
            assert!(low > high, "{dopant:?}: {low} vs {high}");
        }
    }

    #[test]
    fn round_trip_within_modeled_range() {
        for dopant in [Dopant::Arsenic, Dopant::Phosphorus, Dopant::Boron] {
            let grid = crate::logspace(1e15, 1e21, 25);
            let rho: Vec<f64> = grid
                .iter()
                .map(|&n| concentration_to_resistivity(n, dopant))
                .collect();
            let back = resistivity_to_concentration(&rho, dopant);
            for (n0, n1) in grid.iter().zip(back.iter()) {
                let rel = (n1 - n0).abs() / n0;
                assert!(rel < 0.02, "{dopant:?}: {n0} -> {n1} (rel {rel})");
            }
        }
    }

    #[test]
    fn out_of_range_resistivity_clamps_to_bounds() {
        let dopant = Dopant::Boron;
        let rho_hi = concentration_to_resistivity(N_RANGE.0, dopant);
        let rho_lo = concentration_to_resistivity(N_RANGE.1, dopant);
        let out = resistivity_to_concentration(&[rho_hi * 1e3, rho_lo * 1e-3], dopant);
        let at_edges = resistivity_to_concentration(&[rho_hi, rho_lo], dopant);
        assert!((out[0] - at_edges[0]).abs() / at_edges[0] < 1e-9);
        assert!((out[1] - at_edges[1]).abs() / at_edges[1] < 1e-9);
    }
}
