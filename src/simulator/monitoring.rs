//! Offline monitoring simulation over a completed dose schedule.
//!
//! Drives the same stepping kernel as the live induction simulator on the
//! same dense grid, then downsamples to a 1-minute [TimeSeries] for
//! charting and export.

use serde::{Deserialize, Serialize};

use crate::data::{DoseSchedule, Patient};
use crate::model::derive_parameters;
use crate::simulator::output::TimeSeries;
use crate::simulator::{
    mg_per_hr_to_mg_per_min, CompartmentState, IntegrationMethod, Integrator, DT_LIVE_MIN,
};
use crate::SedasimError;

/// Horizon extension past the last dose event, minutes.
const DEFAULT_TAIL_MIN: f64 = 120.0;
/// A dose event is attached to a sample lying within this many minutes.
const EVENT_ATTACH_HALF_WINDOW_MIN: f64 = 0.5;

const TIME_EPS: f64 = 1e-9;

/// Result of a monitoring run: the 1-minute series plus its extrema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MonitoringResult {
    pub patient: Patient,
    pub time_series: TimeSeries,
    pub max_plasma_ug_per_ml: f64,
    pub max_ce_ug_per_ml: f64,
    pub min_bis: f64,
    pub method: IntegrationMethod,
}

/// Integrate a dose schedule to `horizon_min` (default: last event time
/// plus 120 min) and emit the 1-minute observation series.
pub fn simulate(
    patient: &Patient,
    schedule: &DoseSchedule,
    horizon_min: Option<f64>,
) -> Result<MonitoringResult, SedasimError> {
    let params = derive_parameters(patient)?;
    let streams = schedule.materialize();
    let horizon = horizon_min.unwrap_or(schedule.max_event_time() + DEFAULT_TAIL_MIN);

    let dt = DT_LIVE_MIN;
    let total_steps = (horizon / dt).round() as usize;
    let sample_stride = (1.0 / dt).round() as usize;

    let mut integrator = Integrator::new(params.pk, IntegrationMethod::Rk4);
    integrator.record_bolus(streams.initial_bolus_mg());
    let mut state = CompartmentState::with_bolus(streams.initial_bolus_mg());

    let mut series = TimeSeries::new();
    let mut bolus_index = 0;

    for i in 0..=total_steps {
        let t = i as f64 * dt;

        while let Some(bolus) = streams.boluses().get(bolus_index) {
            if bolus.time_min <= t + TIME_EPS {
                state.add_bolus(bolus.amount_mg);
                integrator.record_bolus(bolus.amount_mg);
                bolus_index += 1;
            } else {
                break;
            }
        }

        let rate = streams.rate_at(t);
        if i % sample_stride == 0 {
            series.push(
                t,
                state.plasma(params.pk.v1),
                state.ce,
                rate,
                params.pd.bis(state.ce),
                schedule
                    .event_near(t, EVENT_ATTACH_HALF_WINDOW_MIN)
                    .copied(),
            );
        }
        if i == total_steps {
            break;
        }
        state = integrator.step(&state, mg_per_hr_to_mg_per_min(rate), dt, t)?;
    }

    if integrator.fallback_count() > 0 {
        tracing::info!(
            fallbacks = integrator.fallback_count(),
            "monitoring run completed with Euler fallbacks"
        );
    }

    Ok(MonitoringResult {
        patient: patient.clone(),
        max_plasma_ug_per_ml: series.max_plasma(),
        max_ce_ug_per_ml: series.max_ce(),
        min_bis: series.min_bis(),
        method: integrator.method(),
        time_series: series,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DoseEvent;
    use approx::assert_relative_eq;

    fn induction_then_stop() -> DoseSchedule {
        let mut schedule = DoseSchedule::new();
        schedule.add(DoseEvent::new(0.0, 140.0, 200.0).unwrap());
        schedule.add(DoseEvent::new(30.0, 0.0, 0.0).unwrap());
        schedule
    }

    #[test]
    fn default_horizon_extends_past_the_last_event() {
        let result = simulate(&Patient::reference(), &induction_then_stop(), None).unwrap();
        let series = &result.time_series;
        assert_eq!(series.len(), 151); // samples at 0..=150 min
        assert_relative_eq!(series.t_min()[150], 150.0);
    }

    #[test]
    fn rate_samples_bracket_the_stop_event() {
        let result = simulate(&Patient::reference(), &induction_then_stop(), None).unwrap();
        let series = &result.time_series;
        assert_eq!(series.rate_mg_per_hr()[29], 200.0);
        assert_eq!(series.rate_mg_per_hr()[30], 0.0);
        assert_eq!(series.rate_mg_per_hr()[31], 0.0);
    }

    #[test]
    fn ce_rises_from_zero_and_decays_after_the_stop() {
        let result = simulate(&Patient::reference(), &induction_then_stop(), None).unwrap();
        let series = &result.time_series;
        let ce = series.ce_ug_per_ml();
        assert_eq!(ce[0], 0.0);
        assert!(ce[1] > 0.0);
        // Stopping the infusion steepens the effect-site decay.
        assert!(ce[31] < ce[29]);
        assert!(ce[60] < ce[31]);
        assert!(series.max_ce() > ce[30]);
        // The deepest sedation coincides with the effect-site peak.
        let min_bis_at = series
            .bis()
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        let max_ce_at = ce
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(min_bis_at, max_ce_at);
        assert_relative_eq!(series.bis()[min_bis_at], result.min_bis);
    }

    #[test]
    fn dose_events_attach_to_nearby_samples() {
        let result = simulate(&Patient::reference(), &induction_then_stop(), None).unwrap();
        let events = result.time_series.events();
        assert!(events[0].is_some());
        assert!(events[30].is_some());
        assert_eq!(events[30].unwrap().rate_mg_per_hr(), 0.0);
        assert!(events[15].is_none());
    }

    #[test]
    fn mid_run_bolus_jumps_plasma() {
        let mut schedule = induction_then_stop();
        schedule.add(DoseEvent::new(45.0, 50.0, 0.0).unwrap());
        let result = simulate(&Patient::reference(), &schedule, Some(60.0)).unwrap();
        let plasma = result.time_series.plasma_ug_per_ml();
        assert!(plasma[45] > plasma[44] + 50.0 / 6.3 * 0.9);
    }

    #[test]
    fn identical_inputs_are_bitwise_reproducible() {
        let a = simulate(&Patient::reference(), &induction_then_stop(), None).unwrap();
        let b = simulate(&Patient::reference(), &induction_then_stop(), None).unwrap();
        assert_eq!(a.time_series, b.time_series);
    }

    #[test]
    fn empty_schedule_stays_identically_zero() {
        let result = simulate(&Patient::reference(), &DoseSchedule::new(), Some(30.0)).unwrap();
        for i in 0..result.time_series.len() {
            assert_eq!(result.time_series.plasma_ug_per_ml()[i], 0.0);
            assert_eq!(result.time_series.ce_ug_per_ml()[i], 0.0);
            assert_eq!(result.time_series.bis()[i], 93.0);
        }
    }
}
