//! Performance metrics of a simulated closed-loop protocol run.

use serde::{Deserialize, Serialize};

use crate::optimize::protocol::ProtocolSettings;
use crate::simulator::output::TimeSeries;

/// Score bundle for one candidate protocol.
///
/// `overall_score` is the search objective: maintenance accuracy carries
/// half the weight, stability and convergence a quarter each, and
/// overshoot beyond 10% of target is penalized on top.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PerformanceMetrics {
    /// Mean of the per-maintenance-point scores, 0..100.
    pub maintenance_score: f64,
    /// 100 minus the scaled mean step-to-step ce movement, floored at 0.
    pub stability_index: f64,
    /// First time the effect site is within the convergence band of the
    /// target; `None` when it never converges.
    pub convergence_time_min: Option<f64>,
    pub convergence_score: f64,
    /// Peak ce excess over target, percent, 0 when never above target.
    pub overshoot_percent: f64,
    /// Share of samples within the maintenance tolerance band, percent.
    pub time_in_target_percent: f64,
    pub overall_score: f64,
    pub predicted_final_ce: f64,
    /// Closeness of the final ce to target, percent, floored at 0.
    pub target_accuracy_percent: f64,
    pub adjustment_count: usize,
}

/// Evaluate a completed closed-loop series against the protocol settings.
pub fn evaluate(
    series: &TimeSeries,
    settings: &ProtocolSettings,
    adjustment_count: usize,
) -> PerformanceMetrics {
    let target = settings.target_ce_ug_per_ml;
    let half_window = settings.evaluation_window_min / 2.0;

    let point_scores: Vec<f64> = settings
        .maintenance_points_min
        .iter()
        .filter_map(|tau| {
            series
                .mean_ce_between(tau - half_window, tau + half_window)
                .map(|mean_ce| {
                    let error = (mean_ce - target).abs() / target;
                    if error <= settings.maintenance_tolerance {
                        100.0
                    } else {
                        (100.0 - 500.0 * error).max(0.0)
                    }
                })
        })
        .collect();
    let maintenance_score = if point_scores.is_empty() {
        0.0
    } else {
        point_scores.iter().sum::<f64>() / point_scores.len() as f64
    };

    let ce = series.ce_ug_per_ml();
    let stability_index = if ce.len() < 2 {
        100.0
    } else {
        let mean_step: f64 = ce
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).abs())
            .sum::<f64>()
            / (ce.len() - 1) as f64;
        (100.0 - 1000.0 * mean_step).max(0.0)
    };

    let convergence_band = settings.convergence_threshold_ratio * target;
    let convergence_time_min = series
        .t_min()
        .iter()
        .zip(ce)
        .find(|(_, c)| (**c - target).abs() <= convergence_band)
        .map(|(t, _)| *t);
    let convergence_score = match convergence_time_min {
        Some(t) if t < 30.0 => 100.0,
        Some(t) => (100.0 - 2.0 * (t - 30.0)).max(0.0),
        None => 0.0,
    };

    let overshoot_percent = ((series.max_ce() / target - 1.0) * 100.0).max(0.0);

    let target_band = settings.maintenance_tolerance * target;
    let in_target = ce
        .iter()
        .filter(|c| (**c - target).abs() <= target_band)
        .count();
    let time_in_target_percent = if ce.is_empty() {
        0.0
    } else {
        100.0 * in_target as f64 / ce.len() as f64
    };

    let overall_score = (0.5 * maintenance_score
        + 0.25 * stability_index
        + 0.25 * convergence_score
        - 1.5 * (overshoot_percent - 10.0).max(0.0))
    .max(0.0);

    let predicted_final_ce = ce.last().copied().unwrap_or(0.0);
    let target_accuracy_percent =
        (100.0 * (1.0 - (predicted_final_ce - target).abs() / target)).max(0.0);

    PerformanceMetrics {
        maintenance_score,
        stability_index,
        convergence_time_min,
        convergence_score,
        overshoot_percent,
        time_in_target_percent,
        overall_score,
        predicted_final_ce,
        target_accuracy_percent,
        adjustment_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn flat_series(ce: f64, until_min: f64, dt: f64) -> TimeSeries {
        let mut series = TimeSeries::new();
        let steps = (until_min / dt).round() as usize;
        for i in 0..=steps {
            series.push(i as f64 * dt, ce, ce, 0.0, 50.0, None);
        }
        series
    }

    fn settings() -> ProtocolSettings {
        ProtocolSettings::new(3.0, 140.0, 20.0)
    }

    #[test]
    fn perfect_hold_scores_full_marks() {
        let series = flat_series(3.0, 360.0, 0.1);
        let metrics = evaluate(&series, &settings(), 0);
        assert_relative_eq!(metrics.maintenance_score, 100.0);
        assert_relative_eq!(metrics.stability_index, 100.0);
        assert_eq!(metrics.convergence_time_min, Some(0.0));
        assert_relative_eq!(metrics.overshoot_percent, 0.0);
        assert_relative_eq!(metrics.time_in_target_percent, 100.0);
        assert_relative_eq!(metrics.overall_score, 100.0);
        assert_relative_eq!(metrics.target_accuracy_percent, 100.0);
    }

    #[test]
    fn off_target_hold_loses_maintenance_points() {
        // 20% relative error at every point: 100 - 500*0.2 = 0.
        let series = flat_series(3.6, 360.0, 0.1);
        let metrics = evaluate(&series, &settings(), 0);
        assert_relative_eq!(metrics.maintenance_score, 0.0);
        // ce never enters the 5% convergence band.
        assert_eq!(metrics.convergence_time_min, None);
        assert_relative_eq!(metrics.convergence_score, 0.0);
        // Overshoot of 20% costs 1.5 * 10 on the composite.
        assert_relative_eq!(metrics.overshoot_percent, 20.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.overall_score, 0.25 * 100.0 - 15.0, epsilon = 1e-9);
    }

    #[test]
    fn late_convergence_decays_linearly() {
        let mut series = TimeSeries::new();
        for i in 0..=3600 {
            let t = i as f64 * 0.1;
            let ce = if t < 50.0 { 0.0 } else { 3.0 };
            series.push(t, ce, ce, 0.0, 50.0, None);
        }
        let metrics = evaluate(&series, &settings(), 0);
        assert_relative_eq!(metrics.convergence_time_min.unwrap(), 50.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.convergence_score, 60.0, epsilon = 1e-9);
    }

    #[test]
    fn within_tolerance_hold_keeps_full_maintenance_marks() {
        // Just under 10% off target at every maintenance point.
        let series = flat_series(3.29, 360.0, 0.1);
        let metrics = evaluate(&series, &settings(), 0);
        assert_relative_eq!(metrics.maintenance_score, 100.0);
        // But it sits outside the tighter 5% convergence band forever.
        assert_eq!(metrics.convergence_time_min, None);
    }

    #[test]
    fn empty_series_scores_zero() {
        let metrics = evaluate(&TimeSeries::new(), &settings(), 0);
        assert_eq!(metrics.maintenance_score, 0.0);
        assert_eq!(metrics.convergence_time_min, None);
        assert_eq!(metrics.predicted_final_ce, 0.0);
    }
}
