//! The three-compartment + effect-site integrator and the simulators
//! driving it.
//!
//! One pure stepping kernel serves all temporal modes: the live induction
//! simulator ([induction::InductionSimulator]) advances it tick by tick,
//! the monitoring simulator ([monitoring]) sweeps it over a dose schedule,
//! and the protocol optimizer ([crate::optimize]) wraps it in a feedback
//! controller. Keeping a single kernel makes the engines bit-reproducible
//! for the same dose history.

pub mod induction;
pub mod monitoring;
pub mod output;

use nalgebra::Vector4;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::PkParams;
use crate::SedasimError;

/// Simulated time step of the live simulators, minutes.
pub const DT_LIVE_MIN: f64 = 0.01;
/// Simulated time step of protocol scans, minutes.
pub const DT_PROTOCOL_MIN: f64 = 0.1;
/// Real-time delivery cadence the host timer should aim for. Advisory:
/// the simulated increment per tick is fixed and does not depend on it.
pub const TICK_INTERVAL_MS: u64 = 600;

/// Infusion rates are mg/hr at the API boundary and mg/min inside the ODE.
pub fn mg_per_hr_to_mg_per_min(rate_mg_per_hr: f64) -> f64 {
    rate_mg_per_hr / 60.0
}

/// The stepping scheme in force for a run. Chosen at construction and
/// never hot-swapped mid-run; a NaN fallback is recorded, not a swap.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrationMethod {
    #[default]
    Rk4,
    Euler,
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IntegrationMethod::Rk4 => write!(f, "RK4"),
            IntegrationMethod::Euler => write!(f, "Euler"),
        }
    }
}

/// Drug amounts in the central and two peripheral compartments (mg) plus
/// the effect-site concentration (ug/mL).
///
/// Every component is non-negative after every integration step; a step
/// that undershoots is clamped to zero.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct CompartmentState {
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
    pub ce: f64,
}

impl CompartmentState {
    /// The state immediately after an induction bolus: the full dose in
    /// the central compartment, nothing anywhere else, ce = 0.
    pub fn with_bolus(bolus_mg: f64) -> Self {
        CompartmentState {
            a1: bolus_mg,
            ..Default::default()
        }
    }

    /// Apply an instantaneous dose to the central compartment.
    pub fn add_bolus(&mut self, amount_mg: f64) {
        self.a1 += amount_mg;
    }

    /// Plasma concentration in ug/mL for a central volume in L.
    pub fn plasma(&self, v1: f64) -> f64 {
        self.a1 / v1
    }

    pub fn is_finite(&self) -> bool {
        self.a1.is_finite() && self.a2.is_finite() && self.a3.is_finite() && self.ce.is_finite()
    }

    fn clamped(self) -> Self {
        CompartmentState {
            a1: self.a1.max(0.0),
            a2: self.a2.max(0.0),
            a3: self.a3.max(0.0),
            ce: self.ce.max(0.0),
        }
    }
}

impl From<CompartmentState> for Vector4<f64> {
    fn from(state: CompartmentState) -> Self {
        Vector4::new(state.a1, state.a2, state.a3, state.ce)
    }
}

impl From<Vector4<f64>> for CompartmentState {
    fn from(x: Vector4<f64>) -> Self {
        CompartmentState {
            a1: x[0],
            a2: x[1],
            a3: x[2],
            ce: x[3],
        }
    }
}

/// Right-hand side of the compartment ODE. `rate_mg_per_min` is the
/// piecewise-constant infusion rate in force over the step.
fn derivatives(pk: &PkParams, x: &Vector4<f64>, rate_mg_per_min: f64) -> Vector4<f64> {
    let (k10, k12, k21, k13, k31) = (pk.k10(), pk.k12(), pk.k21(), pk.k13(), pk.k31());
    Vector4::new(
        rate_mg_per_min - (k10 + k12 + k13) * x[0] + k21 * x[1] + k31 * x[2],
        k12 * x[0] - k21 * x[1],
        k13 * x[0] - k31 * x[2],
        pk.ke0 * (x[0] / pk.v1 - x[3]),
    )
}

/// One classical fourth-order Runge-Kutta step, `dt_min` minutes wide.
///
/// Boluses are never smeared across a step: they are applied to the state
/// between steps (or as the initial condition at t = 0).
pub fn step_rk4(
    pk: &PkParams,
    state: &CompartmentState,
    rate_mg_per_min: f64,
    dt_min: f64,
) -> CompartmentState {
    let x: Vector4<f64> = (*state).into();
    let k1 = derivatives(pk, &x, rate_mg_per_min);
    let k2 = derivatives(pk, &(x + k1 * (dt_min / 2.0)), rate_mg_per_min);
    let k3 = derivatives(pk, &(x + k2 * (dt_min / 2.0)), rate_mg_per_min);
    let k4 = derivatives(pk, &(x + k3 * dt_min), rate_mg_per_min);
    let next = x + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (dt_min / 6.0);
    CompartmentState::from(next).clamped()
}

/// One forward-Euler step. Identical signature to [step_rk4]; used as the
/// NaN fallback or when explicitly selected.
pub fn step_euler(
    pk: &PkParams,
    state: &CompartmentState,
    rate_mg_per_min: f64,
    dt_min: f64,
) -> CompartmentState {
    let x: Vector4<f64> = (*state).into();
    let next = x + derivatives(pk, &x, rate_mg_per_min) * dt_min;
    CompartmentState::from(next).clamped()
}

/// Owns the per-run numerical policy around the stepping kernels.
///
/// On a non-finite RK4 result the step is retried once with Euler; if that
/// also fails the state is reset to the last bolus (everything else zero)
/// and a fallback event is recorded. A second reset within the same run is
/// fatal and surfaces [SedasimError::IntegratorDiverged].
#[derive(Debug, Clone)]
pub struct Integrator {
    pk: PkParams,
    method: IntegrationMethod,
    fallback_count: u32,
    reset_count: u32,
    last_bolus_mg: f64,
}

impl Integrator {
    pub fn new(pk: PkParams, method: IntegrationMethod) -> Self {
        Integrator {
            pk,
            method,
            fallback_count: 0,
            reset_count: 0,
            last_bolus_mg: 0.0,
        }
    }

    pub fn pk(&self) -> &PkParams {
        &self.pk
    }

    pub fn method(&self) -> IntegrationMethod {
        self.method
    }

    /// Euler retries taken because RK4 produced a non-finite state.
    pub fn fallback_count(&self) -> u32 {
        self.fallback_count
    }

    /// Remember the most recent bolus; it anchors the safe state used on
    /// divergence.
    pub fn record_bolus(&mut self, amount_mg: f64) {
        self.last_bolus_mg = amount_mg;
    }

    /// Advance `state` by one `dt_min` step under the given infusion rate.
    pub fn step(
        &mut self,
        state: &CompartmentState,
        rate_mg_per_min: f64,
        dt_min: f64,
        t_min: f64,
    ) -> Result<CompartmentState, SedasimError> {
        let next = match self.method {
            IntegrationMethod::Rk4 => {
                let rk4 = step_rk4(&self.pk, state, rate_mg_per_min, dt_min);
                if rk4.is_finite() {
                    rk4
                } else {
                    self.fallback_count += 1;
                    tracing::warn!(
                        t_min,
                        fallback = self.fallback_count,
                        "RK4 produced a non-finite state, retrying the step with Euler"
                    );
                    step_euler(&self.pk, state, rate_mg_per_min, dt_min)
                }
            }
            IntegrationMethod::Euler => step_euler(&self.pk, state, rate_mg_per_min, dt_min),
        };

        if next.is_finite() {
            return Ok(next);
        }

        if self.reset_count > 0 {
            return Err(SedasimError::IntegratorDiverged { time_min: t_min });
        }
        self.reset_count += 1;
        tracing::warn!(
            t_min,
            last_bolus_mg = self.last_bolus_mg,
            "integration diverged, resetting to the safe state"
        );
        Ok(CompartmentState::with_bolus(self.last_bolus_mg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Patient;
    use crate::model::derive_parameters;
    use approx::assert_relative_eq;

    fn reference_pk() -> PkParams {
        derive_parameters(&Patient::reference()).unwrap().pk
    }

    #[test]
    fn zero_dose_zero_state_stays_zero() {
        let pk = reference_pk();
        let mut state = CompartmentState::default();
        for _ in 0..10_000 {
            state = step_rk4(&pk, &state, 0.0, DT_LIVE_MIN);
        }
        assert_eq!(state, CompartmentState::default());
    }

    #[test]
    fn bolus_decays_monotonically_without_infusion() {
        let pk = reference_pk();
        let mut state = CompartmentState::with_bolus(140.0);
        let mut previous_plasma = state.plasma(pk.v1);
        for _ in 0..6_000 {
            state = step_rk4(&pk, &state, 0.0, DT_LIVE_MIN);
            let plasma = state.plasma(pk.v1);
            assert!(plasma <= previous_plasma);
            previous_plasma = plasma;
        }
        assert!(state.a2 > 0.0);
        assert!(state.a3 > 0.0);
        assert!(state.ce > 0.0);
    }

    #[test]
    fn euler_tracks_rk4_at_small_dt() {
        let pk = reference_pk();
        let mut rk4 = CompartmentState::with_bolus(100.0);
        let mut euler = rk4;
        for _ in 0..1_000 {
            rk4 = step_rk4(&pk, &rk4, 2.0, DT_LIVE_MIN);
            euler = step_euler(&pk, &euler, 2.0, DT_LIVE_MIN);
        }
        assert_relative_eq!(rk4.a1, euler.a1, max_relative = 1e-2);
        assert_relative_eq!(rk4.ce, euler.ce, max_relative = 1e-2);
    }

    #[test]
    fn non_finite_rk4_falls_back_to_euler() {
        // An absurd ke0 overflows the RK4 inner evaluations but leaves the
        // first-order Euler step finite.
        let pk = PkParams {
            v1: 6.28,
            v2: 25.5,
            v3: 273.0,
            cl: 1.79,
            q2: 1.83,
            q3: 1.11,
            ke0: 1e160,
        };
        let mut integrator = Integrator::new(pk, IntegrationMethod::Rk4);
        integrator.record_bolus(140.0);
        let state = CompartmentState::with_bolus(140.0);

        let next = integrator.step(&state, 0.0, DT_LIVE_MIN, 0.0).unwrap();
        assert!(next.is_finite());
        assert_eq!(integrator.fallback_count(), 1);
    }

    #[test]
    fn repeated_divergence_is_fatal() {
        let pk = PkParams {
            v1: 6.28,
            v2: 25.5,
            v3: 273.0,
            cl: 1.79,
            q2: 1.83,
            q3: 1.11,
            ke0: f64::MAX,
        };
        let mut integrator = Integrator::new(pk, IntegrationMethod::Rk4);
        integrator.record_bolus(140.0);
        let mut state = CompartmentState::with_bolus(140.0);

        // First divergence resets to the safe state.
        state = integrator.step(&state, 0.0, 1.0, 0.0).unwrap();
        assert_eq!(state, CompartmentState::with_bolus(140.0));
        // A second one is fatal.
        let err = integrator.step(&state, 0.0, 1.0, 1.0).unwrap_err();
        assert!(matches!(err, SedasimError::IntegratorDiverged { .. }));
    }

    #[test]
    fn negative_undershoot_is_clamped() {
        let pk = reference_pk();
        // A very large Euler step over-depletes the central compartment.
        let state = CompartmentState::with_bolus(1.0);
        let next = step_euler(&pk, &state, 0.0, 10.0);
        assert!(next.a1 >= 0.0);
        assert!(next.is_finite());
    }
}
