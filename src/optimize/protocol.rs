//! Closed-loop step-down protocol simulation and the nested grid search
//! for the initial infusion rate.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::data::Patient;
use crate::model::{derive_parameters, DerivedParams};
use crate::optimize::schedule::{build_schedule, ProtocolSchedule};
use crate::optimize::scoring::{evaluate, PerformanceMetrics};
use crate::simulator::output::TimeSeries;
use crate::simulator::{
    mg_per_hr_to_mg_per_min, CompartmentState, IntegrationMethod, Integrator, DT_PROTOCOL_MIN,
};
use crate::SedasimError;

/// Hard ceiling of the initial-rate search, mg/hr.
const SEARCH_CEILING_MG_PER_HR: f64 = 2000.0;
/// Expected step-downs are capped at this many when sizing the search.
const MAX_EXPECTED_STEP_DOWNS: f64 = 15.0;
/// The trailing window over which the adjustment budget applies, minutes.
const ADJUSTMENT_WINDOW_MIN: f64 = 60.0;

/// Tunable parameters of a step-down protocol run.
///
/// `new` fills everything beyond the three operator inputs with the
/// published defaults; deserialization does the same for absent fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolSettings {
    pub target_ce_ug_per_ml: f64,
    pub bolus_mg: f64,
    pub target_reach_time_min: f64,
    #[serde(default = "default_upper_threshold_ratio")]
    pub upper_threshold_ratio: f64,
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: f64,
    #[serde(default = "default_adjustment_interval")]
    pub adjustment_interval_min: f64,
    #[serde(default = "default_time_step")]
    pub time_step_min: f64,
    #[serde(default = "default_simulation_duration")]
    pub simulation_duration_min: f64,
    #[serde(default = "default_maintenance_points")]
    pub maintenance_points_min: Vec<f64>,
    #[serde(default = "default_max_adjustments_per_hour")]
    pub max_adjustments_per_hour: usize,
    #[serde(default = "default_maintenance_tolerance")]
    pub maintenance_tolerance: f64,
    #[serde(default = "default_evaluation_window")]
    pub evaluation_window_min: f64,
    #[serde(default = "default_minimum_rate")]
    pub minimum_rate_mg_per_hr: f64,
    #[serde(default = "default_convergence_threshold_ratio")]
    pub convergence_threshold_ratio: f64,
}

fn default_upper_threshold_ratio() -> f64 {
    1.20
}
fn default_reduction_factor() -> f64 {
    0.70
}
fn default_adjustment_interval() -> f64 {
    5.0
}
fn default_time_step() -> f64 {
    DT_PROTOCOL_MIN
}
fn default_simulation_duration() -> f64 {
    360.0
}
fn default_maintenance_points() -> Vec<f64> {
    vec![30.0, 60.0, 90.0, 120.0]
}
fn default_max_adjustments_per_hour() -> usize {
    3
}
fn default_maintenance_tolerance() -> f64 {
    0.10
}
fn default_evaluation_window() -> f64 {
    5.0
}
fn default_minimum_rate() -> f64 {
    0.1
}
fn default_convergence_threshold_ratio() -> f64 {
    0.05
}

impl ProtocolSettings {
    /// Settings for the given operator inputs with all tunables at their
    /// defaults.
    pub fn new(target_ce_ug_per_ml: f64, bolus_mg: f64, target_reach_time_min: f64) -> Self {
        ProtocolSettings {
            target_ce_ug_per_ml,
            bolus_mg,
            target_reach_time_min,
            upper_threshold_ratio: default_upper_threshold_ratio(),
            reduction_factor: default_reduction_factor(),
            adjustment_interval_min: default_adjustment_interval(),
            time_step_min: default_time_step(),
            simulation_duration_min: default_simulation_duration(),
            maintenance_points_min: default_maintenance_points(),
            max_adjustments_per_hour: default_max_adjustments_per_hour(),
            maintenance_tolerance: default_maintenance_tolerance(),
            evaluation_window_min: default_evaluation_window(),
            minimum_rate_mg_per_hr: default_minimum_rate(),
            convergence_threshold_ratio: default_convergence_threshold_ratio(),
        }
    }

    /// The effect-site concentration that triggers a step-down.
    pub fn upper_threshold(&self) -> f64 {
        self.target_ce_ug_per_ml * self.upper_threshold_ratio
    }

    /// Check every field against its admissible range, collecting one
    /// message per violation.
    pub fn validate(&self) -> Result<(), SedasimError> {
        let mut messages = Vec::new();
        let mut check = |name: &str, value: f64, lo: f64, hi: f64| {
            if !value.is_finite() || value < lo || value > hi {
                messages.push(format!("{name} must be within {lo}..{hi}, got {value}"));
            }
        };
        check("target ce", self.target_ce_ug_per_ml, 0.5, 8.0);
        check("bolus", self.bolus_mg, 10.0, 200.0);
        check("target reach time", self.target_reach_time_min, 10.0, 60.0);
        check("upper threshold ratio", self.upper_threshold_ratio, 1.05, 1.30);
        check("reduction factor", self.reduction_factor, 0.50, 0.90);
        check(
            "adjustment interval",
            self.adjustment_interval_min,
            3.0,
            10.0,
        );
        check("time step", self.time_step_min, 1e-4, 1.0);
        check(
            "simulation duration",
            self.simulation_duration_min,
            30.0,
            1440.0,
        );
        check(
            "minimum rate",
            self.minimum_rate_mg_per_hr,
            1e-3,
            100.0,
        );
        if self.max_adjustments_per_hour == 0 {
            messages.push("max adjustments per hour must be at least 1".to_string());
        }
        if self.maintenance_points_min.is_empty() {
            messages.push("at least one maintenance point is required".to_string());
        }
        if messages.is_empty() {
            Ok(())
        } else {
            Err(SedasimError::InvalidSettings { messages })
        }
    }
}

/// One step-down taken by the threshold controller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentEvent {
    pub time_min: f64,
    pub old_rate_mg_per_hr: f64,
    pub new_rate_mg_per_hr: f64,
    pub ce_at_event: f64,
    /// 1-based position in the run's adjustment sequence.
    pub adjustment_number: usize,
    pub reduction_percent: f64,
}

/// Chart-ready arrays for the UI layer: the full scan-resolution series
/// plus the target and threshold guide lines and the adjustment markers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChartPayload {
    pub times_min: Vec<f64>,
    pub plasma_ug_per_ml: Vec<f64>,
    pub ce_ug_per_ml: Vec<f64>,
    pub infusion_rate_mg_per_hr: Vec<f64>,
    pub target_line: Vec<f64>,
    pub upper_threshold_line: Vec<f64>,
    pub adjustment_times_min: Vec<f64>,
    pub adjustment_labels: Vec<String>,
}

/// Everything a caller gets back from [optimize_protocol].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolResult {
    pub optimal_initial_rate_mg_per_hr: f64,
    pub time_series: TimeSeries,
    pub adjustments: Vec<AdjustmentEvent>,
    pub performance: PerformanceMetrics,
    pub schedule: ProtocolSchedule,
    pub chart: ChartPayload,
    /// Set when the grid search exhausted its bound without a positive
    /// score; the result is then best-effort.
    pub warning: Option<String>,
}

pub(crate) struct ClosedLoopRun {
    pub series: TimeSeries,
    pub adjustments: Vec<AdjustmentEvent>,
}

/// Simulate the full closed-loop threshold controller at one candidate
/// initial rate.
///
/// A step-down fires when the effect site reaches the upper threshold,
/// the cooldown since the previous adjustment has elapsed, fewer than the
/// hourly budget of adjustments happened in the trailing 60 minutes, and
/// the rate is still above the floor.
pub(crate) fn simulate_closed_loop(
    params: &DerivedParams,
    settings: &ProtocolSettings,
    initial_rate_mg_per_hr: f64,
) -> Result<ClosedLoopRun, SedasimError> {
    let dt = settings.time_step_min;
    let steps = (settings.simulation_duration_min / dt).round() as usize;
    let upper_threshold = settings.upper_threshold();

    let mut integrator = Integrator::new(params.pk, IntegrationMethod::Rk4);
    integrator.record_bolus(settings.bolus_mg);
    let mut state = CompartmentState::with_bolus(settings.bolus_mg);
    let mut rate = initial_rate_mg_per_hr;
    let mut last_adjustment_t = f64::NEG_INFINITY;
    let mut recent_adjustments: VecDeque<f64> = VecDeque::new();
    let mut adjustments = Vec::new();
    let mut series = TimeSeries::new();

    for i in 0..=steps {
        let t = i as f64 * dt;
        while recent_adjustments
            .front()
            .map(|t0| *t0 < t - ADJUSTMENT_WINDOW_MIN)
            .unwrap_or(false)
        {
            recent_adjustments.pop_front();
        }

        if state.ce >= upper_threshold
            && t - last_adjustment_t >= settings.adjustment_interval_min
            && recent_adjustments.len() < settings.max_adjustments_per_hour
            && rate > settings.minimum_rate_mg_per_hr
        {
            let new_rate = (rate * settings.reduction_factor).max(settings.minimum_rate_mg_per_hr);
            adjustments.push(AdjustmentEvent {
                time_min: t,
                old_rate_mg_per_hr: rate,
                new_rate_mg_per_hr: new_rate,
                ce_at_event: state.ce,
                adjustment_number: adjustments.len() + 1,
                reduction_percent: (1.0 - new_rate / rate) * 100.0,
            });
            rate = new_rate;
            last_adjustment_t = t;
            recent_adjustments.push_back(t);
        }

        series.push(
            t,
            state.plasma(params.pk.v1),
            state.ce,
            rate,
            params.pd.bis(state.ce),
            None,
        );
        if i == steps {
            break;
        }
        state = integrator.step(&state, mg_per_hr_to_mg_per_min(rate), dt, t)?;
    }

    Ok(ClosedLoopRun {
        series,
        adjustments,
    })
}

/// Upper bound of the initial-rate search.
///
/// The more step-downs the controller is expected to take over the
/// session, the more the starting rate must compensate for the cumulative
/// reduction.
fn search_ceiling(settings: &ProtocolSettings) -> f64 {
    let hours = settings.simulation_duration_min / 60.0;
    let expected_step_downs =
        (0.7 * settings.max_adjustments_per_hour as f64 * hours).min(MAX_EXPECTED_STEP_DOWNS);
    let cumulative_reduction = settings.reduction_factor.powf(expected_step_downs);
    let compensation = 1.0 / cumulative_reduction;
    let base = if settings.target_ce_ug_per_ml <= 2.0 {
        800.0
    } else {
        1200.0
    };
    (base * compensation).min(SEARCH_CEILING_MG_PER_HR)
}

fn grid(lo: f64, hi: f64, step: f64) -> Vec<f64> {
    let mut rates = Vec::new();
    let mut rate = lo;
    while rate <= hi + 1e-9 {
        rates.push(rate);
        rate += step;
    }
    rates
}

struct Candidate {
    rate: f64,
    metrics: PerformanceMetrics,
    run: ClosedLoopRun,
}

fn best_candidate(
    params: &DerivedParams,
    settings: &ProtocolSettings,
    rates: &[f64],
    mut incumbent: Option<Candidate>,
) -> Result<Option<Candidate>, SedasimError> {
    for &rate in rates {
        let run = simulate_closed_loop(params, settings, rate)?;
        let metrics = evaluate(&run.series, settings, run.adjustments.len());
        let better = incumbent
            .as_ref()
            .map(|best| metrics.overall_score > best.metrics.overall_score)
            .unwrap_or(true);
        if better {
            incumbent = Some(Candidate { rate, metrics, run });
        }
    }
    Ok(incumbent)
}

/// Design a step-down protocol for the patient: nested grid search on the
/// initial infusion rate, scoring each candidate's simulated closed loop.
pub fn optimize_protocol(
    patient: &Patient,
    settings: &ProtocolSettings,
) -> Result<ProtocolResult, SedasimError> {
    settings.validate()?;
    let params = derive_parameters(patient)?;
    optimize_with_params(&params, settings)
}

pub(crate) fn optimize_with_params(
    params: &DerivedParams,
    settings: &ProtocolSettings,
) -> Result<ProtocolResult, SedasimError> {
    let max_rate = search_ceiling(settings);
    let coarse_step = if settings.target_ce_ug_per_ml <= 2.0 {
        30.0
    } else {
        40.0
    };

    let coarse = grid(100.0, max_rate, coarse_step);
    tracing::debug!(candidates = coarse.len(), max_rate, "coarse scan");
    let best = best_candidate(params, settings, &coarse, None)?
        .expect("coarse grid is never empty");
    tracing::debug!(rate = best.rate, score = best.metrics.overall_score, "coarse best");

    let pad = (0.3 * best.rate).max(150.0);
    let medium = grid(
        (best.rate - pad).max(50.0),
        (best.rate + pad).min(max_rate),
        10.0,
    );
    tracing::debug!(candidates = medium.len(), "medium scan");
    let best = best_candidate(params, settings, &medium, Some(best))?
        .expect("incumbent is preserved");
    tracing::debug!(rate = best.rate, score = best.metrics.overall_score, "medium best");

    let pad = (0.1 * best.rate).max(50.0);
    let fine = grid(
        (best.rate - pad).max(20.0),
        (best.rate + pad).min(max_rate),
        2.0,
    );
    tracing::debug!(candidates = fine.len(), "fine scan");
    let best = best_candidate(params, settings, &fine, Some(best))?
        .expect("incumbent is preserved");
    tracing::info!(
        rate = best.rate,
        score = best.metrics.overall_score,
        adjustments = best.run.adjustments.len(),
        "protocol search finished"
    );

    let warning = (best.metrics.overall_score <= 0.0).then(|| {
        let message = format!(
            "no candidate initial rate up to {max_rate:.0} mg/hr scored above zero; \
             returning the best available ({:.0} mg/hr)",
            best.rate
        );
        tracing::warn!("{message}");
        message
    });

    let chart = build_chart(&best.run, settings);
    let schedule = build_schedule(settings, best.rate, &best.run);

    Ok(ProtocolResult {
        optimal_initial_rate_mg_per_hr: best.rate,
        performance: best.metrics,
        schedule,
        chart,
        adjustments: best.run.adjustments.clone(),
        time_series: best.run.series,
        warning,
    })
}

fn build_chart(run: &ClosedLoopRun, settings: &ProtocolSettings) -> ChartPayload {
    let series = &run.series;
    let n = series.len();
    ChartPayload {
        times_min: series.t_min().to_vec(),
        plasma_ug_per_ml: series.plasma_ug_per_ml().to_vec(),
        ce_ug_per_ml: series.ce_ug_per_ml().to_vec(),
        infusion_rate_mg_per_hr: series.rate_mg_per_hr().to_vec(),
        target_line: vec![settings.target_ce_ug_per_ml; n],
        upper_threshold_line: vec![settings.upper_threshold(); n],
        adjustment_times_min: run.adjustments.iter().map(|a| a.time_min).collect(),
        adjustment_labels: run
            .adjustments
            .iter()
            .map(|a| {
                format!(
                    "#{}: {:.0} -> {:.0} mg/hr",
                    a.adjustment_number, a.old_rate_mg_per_hr, a.new_rate_mg_per_hr
                )
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Patient;

    fn reference_params() -> DerivedParams {
        derive_parameters(&Patient::reference()).unwrap()
    }

    #[test]
    fn settings_validation_lists_every_violation() {
        let mut settings = ProtocolSettings::new(10.0, 5.0, 5.0);
        settings.upper_threshold_ratio = 2.0;
        let err = settings.validate().unwrap_err();
        match err {
            SedasimError::InvalidSettings { messages } => assert_eq!(messages.len(), 4),
            other => panic!("expected InvalidSettings, got {other:?}"),
        }
    }

    #[test]
    fn search_ceiling_honours_the_hard_cap() {
        let settings = ProtocolSettings::new(3.0, 140.0, 20.0);
        assert_eq!(search_ceiling(&settings), SEARCH_CEILING_MG_PER_HR);

        // A short session with a gentle reduction needs little compensation.
        let mut gentle = ProtocolSettings::new(1.5, 140.0, 20.0);
        gentle.reduction_factor = 0.90;
        gentle.simulation_duration_min = 60.0;
        let ceiling = search_ceiling(&gentle);
        assert!(ceiling < SEARCH_CEILING_MG_PER_HR);
        assert!(ceiling > 800.0);
    }

    #[test]
    fn grid_includes_both_ends_when_aligned() {
        let rates = grid(100.0, 200.0, 50.0);
        assert_eq!(rates, vec![100.0, 150.0, 200.0]);
    }

    #[test]
    fn step_downs_respect_cooldown_and_budget() {
        let params = reference_params();
        let settings = ProtocolSettings::new(3.0, 140.0, 20.0);
        // Deliberately excessive rate to force repeated threshold crossings.
        let run = simulate_closed_loop(&params, &settings, 1500.0).unwrap();
        assert!(!run.adjustments.is_empty());

        for pair in run.adjustments.windows(2) {
            assert!(pair[1].time_min - pair[0].time_min >= settings.adjustment_interval_min - 1e-9);
        }
        for (i, a) in run.adjustments.iter().enumerate() {
            let in_window = run
                .adjustments
                .iter()
                .filter(|b| b.time_min > a.time_min - ADJUSTMENT_WINDOW_MIN + 1e-9
                    && b.time_min <= a.time_min + 1e-9)
                .count();
            assert!(in_window <= settings.max_adjustments_per_hour);
            assert_eq!(a.adjustment_number, i + 1);
            let expected = (a.old_rate_mg_per_hr * settings.reduction_factor)
                .max(settings.minimum_rate_mg_per_hr);
            assert_eq!(a.new_rate_mg_per_hr, expected);
            assert!(a.ce_at_event >= settings.upper_threshold());
        }
    }

    #[test]
    fn rate_never_falls_below_the_floor() {
        let params = reference_params();
        let mut settings = ProtocolSettings::new(3.0, 140.0, 20.0);
        settings.reduction_factor = 0.50;
        let run = simulate_closed_loop(&params, &settings, 2000.0).unwrap();
        for rate in run.series.rate_mg_per_hr() {
            assert!(*rate >= settings.minimum_rate_mg_per_hr);
        }
    }

    #[test]
    fn series_spans_the_whole_session() {
        let params = reference_params();
        let settings = ProtocolSettings::new(3.0, 140.0, 20.0);
        let run = simulate_closed_loop(&params, &settings, 300.0).unwrap();
        assert_eq!(run.series.len(), 3601);
        assert!((run.series.t_min().last().unwrap() - 360.0).abs() < 1e-6);
    }
}
