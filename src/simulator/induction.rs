//! Live induction simulator.
//!
//! A host-provided timer calls [InductionSimulator::tick] on a real-time
//! cadence (about [crate::simulator::TICK_INTERVAL_MS] ms); every tick
//! advances simulated time by exactly [DT_LIVE_MIN] minutes regardless of
//! the wall clock, so the live engine and the offline monitoring engine
//! produce identical trajectories for the same dose history.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::Patient;
use crate::model::{derive_parameters, DerivedParams};
use crate::simulator::{
    mg_per_hr_to_mg_per_min, CompartmentState, IntegrationMethod, Integrator, DT_LIVE_MIN,
};
use crate::SedasimError;

/// Retained history depth of [InductionSimulator::take_snapshot].
pub const SNAPSHOT_RING_CAPACITY: usize = 10;

const INDUCTION_BOLUS_RANGE: (f64, f64) = (10.0, 200.0);
const INDUCTION_RATE_RANGE: (f64, f64) = (0.0, 500.0);

/// A point-in-time record of the live observables.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub elapsed_min: f64,
    pub plasma_ug_per_ml: f64,
    pub ce_ug_per_ml: f64,
    pub bis: f64,
}

/// What the UI layer sees after every tick.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LiveObservables {
    pub elapsed_min: f64,
    /// Elapsed simulated time rendered as HH:MM:SS.
    pub elapsed_clock: String,
    pub plasma_ug_per_ml: f64,
    pub ce_ug_per_ml: f64,
    pub bis: f64,
    pub method: IntegrationMethod,
    pub snapshots: Vec<Snapshot>,
}

impl fmt::Display for LiveObservables {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} plasma {:.3} ug/mL, ce {:.3} ug/mL, BIS {:.1}",
            self.elapsed_clock, self.plasma_ug_per_ml, self.ce_ug_per_ml, self.bis
        )
    }
}

type StateCallback = Box<dyn FnMut(&LiveObservables) -> Result<(), SedasimError>>;

/// Tick-driven simulator for the induction phase: one t = 0 bolus plus a
/// continuous infusion whose rate may be changed mid-run.
///
/// Single-threaded cooperative: [tick](Self::tick) is the only writer of
/// the compartment state, and callbacks run synchronously inside it.
/// Callback errors are logged and swallowed; they never abort the loop.
#[derive(Default)]
pub struct InductionSimulator {
    running: bool,
    patient: Option<Patient>,
    params: Option<DerivedParams>,
    integrator: Option<Integrator>,
    state: CompartmentState,
    bolus_mg: f64,
    rate_mg_per_hr: f64,
    step_count: u64,
    snapshots: VecDeque<Snapshot>,
    callbacks: Vec<StateCallback>,
}

impl InductionSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive parameters for `patient` and begin a run with the bolus as
    /// the initial condition.
    ///
    /// Returns `Ok(false)` without touching the run if one is already in
    /// progress. Parameter-derivation failures abort the start.
    pub fn start(
        &mut self,
        patient: Patient,
        bolus_mg: f64,
        continuous_mg_per_hr: f64,
    ) -> Result<bool, SedasimError> {
        if self.running {
            return Ok(false);
        }
        let mut messages = Vec::new();
        if bolus_mg < INDUCTION_BOLUS_RANGE.0 || bolus_mg > INDUCTION_BOLUS_RANGE.1 {
            messages.push(format!(
                "induction bolus must be within {}..{} mg, got {}",
                INDUCTION_BOLUS_RANGE.0, INDUCTION_BOLUS_RANGE.1, bolus_mg
            ));
        }
        if continuous_mg_per_hr < INDUCTION_RATE_RANGE.0
            || continuous_mg_per_hr > INDUCTION_RATE_RANGE.1
        {
            messages.push(format!(
                "continuous rate must be within {}..{} mg/hr, got {}",
                INDUCTION_RATE_RANGE.0, INDUCTION_RATE_RANGE.1, continuous_mg_per_hr
            ));
        }
        if !messages.is_empty() {
            return Err(SedasimError::InvalidDoseEvent { messages });
        }

        let params = derive_parameters(&patient)?;
        let mut integrator = Integrator::new(params.pk, IntegrationMethod::Rk4);
        integrator.record_bolus(bolus_mg);

        self.patient = Some(patient);
        self.params = Some(params);
        self.integrator = Some(integrator);
        self.state = CompartmentState::with_bolus(bolus_mg);
        self.bolus_mg = bolus_mg;
        self.rate_mg_per_hr = continuous_mg_per_hr;
        self.step_count = 0;
        self.snapshots.clear();
        self.running = true;
        tracing::debug!(bolus_mg, continuous_mg_per_hr, "induction started");
        Ok(true)
    }

    /// Advance simulated time by one fixed [DT_LIVE_MIN] increment and fan
    /// the new observables out to the registered callbacks.
    ///
    /// A tick on a stopped simulator is a no-op returning `Ok(false)`.
    pub fn tick(&mut self) -> Result<bool, SedasimError> {
        if !self.running {
            return Ok(false);
        }
        let integrator = self
            .integrator
            .as_mut()
            .ok_or(SedasimError::IntegratorDiverged { time_min: 0.0 })?;
        let t_min = self.step_count as f64 * DT_LIVE_MIN;
        self.state = integrator.step(
            &self.state,
            mg_per_hr_to_mg_per_min(self.rate_mg_per_hr),
            DT_LIVE_MIN,
            t_min,
        )?;
        self.step_count += 1;

        let observables = self
            .observables()
            .expect("observables exist while running");
        for callback in &mut self.callbacks {
            if let Err(error) = callback(&observables) {
                tracing::warn!(%error, "induction callback failed, continuing");
            }
        }
        Ok(true)
    }

    /// Change the continuous rate mid-run. Re-bolusing is out of scope, so
    /// the bolus argument of the original interface is ignored. Returns
    /// `false` (no-op) when stopped or when the rate is out of range.
    pub fn update_dose(&mut self, _bolus_mg: f64, continuous_mg_per_hr: f64) -> bool {
        if !self.running {
            return false;
        }
        if !(INDUCTION_RATE_RANGE.0..=INDUCTION_RATE_RANGE.1).contains(&continuous_mg_per_hr) {
            tracing::warn!(
                continuous_mg_per_hr,
                "ignoring out-of-range rate update during induction"
            );
            return false;
        }
        self.rate_mg_per_hr = continuous_mg_per_hr;
        true
    }

    /// Push the current observables onto the snapshot ring, rotating the
    /// oldest out beyond [SNAPSHOT_RING_CAPACITY]. No-op when stopped.
    pub fn take_snapshot(&mut self) -> bool {
        let Some(observables) = self.observables() else {
            return false;
        };
        if !self.running {
            return false;
        }
        if self.snapshots.len() == SNAPSHOT_RING_CAPACITY {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(Snapshot {
            elapsed_min: observables.elapsed_min,
            plasma_ug_per_ml: observables.plasma_ug_per_ml,
            ce_ug_per_ml: observables.ce_ug_per_ml,
            bis: observables.bis,
        });
        true
    }

    /// Halt ticking. Immediate and idempotent; the last state remains
    /// observable until [reset](Self::reset).
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Stop and discard the run: state, parameters, counters, snapshots.
    pub fn reset(&mut self) {
        self.running = false;
        self.patient = None;
        self.params = None;
        self.integrator = None;
        self.state = CompartmentState::default();
        self.bolus_mg = 0.0;
        self.rate_mg_per_hr = 0.0;
        self.step_count = 0;
        self.snapshots.clear();
    }

    /// Register a per-tick observer. Callbacks are invoked in registration
    /// order; one registered during a run first fires on the next tick.
    pub fn on_state<F>(&mut self, callback: F)
    where
        F: FnMut(&LiveObservables) -> Result<(), SedasimError> + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The patient of the current (or last) run.
    pub fn patient(&self) -> Option<&Patient> {
        self.patient.as_ref()
    }

    /// The induction bolus applied at start.
    pub fn bolus_mg(&self) -> f64 {
        self.bolus_mg
    }

    pub fn elapsed_min(&self) -> f64 {
        self.step_count as f64 * DT_LIVE_MIN
    }

    pub fn state(&self) -> &CompartmentState {
        &self.state
    }

    pub fn rate_mg_per_hr(&self) -> f64 {
        self.rate_mg_per_hr
    }

    /// The current live observables, or `None` before the first start.
    pub fn observables(&self) -> Option<LiveObservables> {
        let params = self.params.as_ref()?;
        let integrator = self.integrator.as_ref()?;
        let elapsed_min = self.elapsed_min();
        Some(LiveObservables {
            elapsed_min,
            elapsed_clock: format_elapsed(elapsed_min),
            plasma_ug_per_ml: self.state.plasma(params.pk.v1),
            ce_ug_per_ml: self.state.ce,
            bis: params.pd.bis(self.state.ce),
            method: integrator.method(),
            snapshots: self.snapshots.iter().copied().collect(),
        })
    }
}

/// Render elapsed simulated minutes as HH:MM:SS.
pub fn format_elapsed(elapsed_min: f64) -> String {
    let total_seconds = (elapsed_min * 60.0).round().max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60
    )
}
