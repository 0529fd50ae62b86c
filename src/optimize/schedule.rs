//! Human-readable rendering of an optimized protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::optimize::protocol::{ClosedLoopRun, ProtocolSettings};

/// One row of the protocol schedule.
///
/// Rows are typed so downstream consumers can render or filter them; the
/// section structure of the original report lives only in the `Display`
/// rendering of [ProtocolSchedule].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ScheduleRow {
    Bolus {
        bolus_mg: f64,
    },
    StartInfusion {
        rate_mg_per_hr: f64,
    },
    StepDown {
        time_min: f64,
        rate_mg_per_hr: f64,
        ce_ug_per_ml: f64,
        adjustment_number: usize,
    },
    MaintenancePoint {
        time_min: f64,
        mean_ce_ug_per_ml: f64,
        relative_error_percent: f64,
        within_tolerance: bool,
    },
}

/// The ordered schedule handed back with a
/// [ProtocolResult](crate::optimize::ProtocolResult): dosing rows first,
/// then one summary row per maintenance point.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolSchedule {
    pub target_ce_ug_per_ml: f64,
    pub target_reach_time_min: f64,
    pub rows: Vec<ScheduleRow>,
}

pub(crate) fn build_schedule(
    settings: &ProtocolSettings,
    optimal_rate_mg_per_hr: f64,
    run: &ClosedLoopRun,
) -> ProtocolSchedule {
    let mut rows = vec![
        ScheduleRow::Bolus {
            bolus_mg: settings.bolus_mg,
        },
        ScheduleRow::StartInfusion {
            rate_mg_per_hr: optimal_rate_mg_per_hr,
        },
    ];

    for adjustment in &run.adjustments {
        rows.push(ScheduleRow::StepDown {
            time_min: adjustment.time_min,
            rate_mg_per_hr: adjustment.new_rate_mg_per_hr,
            // The concentration is read back from the simulated series
            // rather than the controller's trigger value.
            ce_ug_per_ml: run
                .series
                .ce_at(adjustment.time_min)
                .unwrap_or(adjustment.ce_at_event),
            adjustment_number: adjustment.adjustment_number,
        });
    }

    let half_window = settings.evaluation_window_min / 2.0;
    for &tau in &settings.maintenance_points_min {
        if let Some(mean_ce) = run
            .series
            .mean_ce_between(tau - half_window, tau + half_window)
        {
            let relative_error =
                (mean_ce - settings.target_ce_ug_per_ml).abs() / settings.target_ce_ug_per_ml;
            rows.push(ScheduleRow::MaintenancePoint {
                time_min: tau,
                mean_ce_ug_per_ml: mean_ce,
                relative_error_percent: relative_error * 100.0,
                within_tolerance: relative_error <= settings.maintenance_tolerance,
            });
        }
    }

    ProtocolSchedule {
        target_ce_ug_per_ml: settings.target_ce_ug_per_ml,
        target_reach_time_min: settings.target_reach_time_min,
        rows,
    }
}

impl fmt::Display for ProtocolSchedule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Step-down protocol: target ce {:.2} ug/mL, reach by {:.0} min",
            self.target_ce_ug_per_ml, self.target_reach_time_min
        )?;
        let mut maintenance_header_written = false;
        for row in &self.rows {
            match row {
                ScheduleRow::Bolus { bolus_mg } => {
                    writeln!(f, "  t=0.0 min: bolus {bolus_mg:.0} mg")?;
                }
                ScheduleRow::StartInfusion { rate_mg_per_hr } => {
                    writeln!(f, "  t=0.0 min: start infusion at {rate_mg_per_hr:.0} mg/hr")?;
                }
                ScheduleRow::StepDown {
                    time_min,
                    rate_mg_per_hr,
                    ce_ug_per_ml,
                    adjustment_number,
                } => {
                    writeln!(
                        f,
                        "  t={time_min:.1} min: step-down #{adjustment_number} to \
                         {rate_mg_per_hr:.0} mg/hr (ce {ce_ug_per_ml:.2} ug/mL)"
                    )?;
                }
                ScheduleRow::MaintenancePoint {
                    time_min,
                    mean_ce_ug_per_ml,
                    relative_error_percent,
                    within_tolerance,
                } => {
                    if !maintenance_header_written {
                        writeln!(f, "Maintenance point evaluation:")?;
                        maintenance_header_written = true;
                    }
                    writeln!(
                        f,
                        "  t={time_min:.0} min: mean ce {mean_ce_ug_per_ml:.2} ug/mL \
                         (error {relative_error_percent:.1}%, {})",
                        if *within_tolerance {
                            "within tolerance"
                        } else {
                            "out of tolerance"
                        }
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Patient;
    use crate::model::derive_parameters;
    use crate::optimize::protocol::simulate_closed_loop;

    #[test]
    fn schedule_rows_follow_the_run() {
        let params = derive_parameters(&Patient::reference()).unwrap();
        let settings = ProtocolSettings::new(3.0, 140.0, 20.0);
        let run = simulate_closed_loop(&params, &settings, 1500.0).unwrap();
        let schedule = build_schedule(&settings, 1500.0, &run);

        assert!(matches!(schedule.rows[0], ScheduleRow::Bolus { bolus_mg } if bolus_mg == 140.0));
        assert!(matches!(
            schedule.rows[1],
            ScheduleRow::StartInfusion { rate_mg_per_hr } if rate_mg_per_hr == 1500.0
        ));

        let step_downs = schedule
            .rows
            .iter()
            .filter(|row| matches!(row, ScheduleRow::StepDown { .. }))
            .count();
        assert_eq!(step_downs, run.adjustments.len());

        let maintenance_rows = schedule
            .rows
            .iter()
            .filter(|row| matches!(row, ScheduleRow::MaintenancePoint { .. }))
            .count();
        assert_eq!(maintenance_rows, settings.maintenance_points_min.len());
    }

    #[test]
    fn rendering_contains_sections_in_order() {
        let params = derive_parameters(&Patient::reference()).unwrap();
        let settings = ProtocolSettings::new(3.0, 140.0, 20.0);
        let run = simulate_closed_loop(&params, &settings, 1500.0).unwrap();
        let schedule = build_schedule(&settings, 1500.0, &run);

        let text = schedule.to_string();
        let bolus_at = text.find("bolus").unwrap();
        let start_at = text.find("start infusion").unwrap();
        let maintenance_at = text.find("Maintenance point evaluation").unwrap();
        assert!(bolus_at < start_at);
        assert!(start_at < maintenance_at);
    }
}
