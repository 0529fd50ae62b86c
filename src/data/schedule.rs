use std::fmt;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::SedasimError;

/// Two event times closer than this are treated as simultaneous.
const TIME_EPS: f64 = 1e-9;

const BOLUS_RANGE: (f64, f64) = (0.0, 200.0);
const RATE_RANGE: (f64, f64) = (0.0, 500.0);

/// A user-level dosing action: an optional bolus and/or a change of the
/// continuous infusion rate, both taking effect at `time_min`.
///
/// The rate is declarative: it is the rate that runs *from* this event
/// until the next rate-bearing event, in mg/hr.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DoseEvent {
    time_min: f64,
    bolus_mg: f64,
    rate_mg_per_hr: f64,
}

impl DoseEvent {
    /// Create a validated dose event.
    pub fn new(time_min: f64, bolus_mg: f64, rate_mg_per_hr: f64) -> Result<Self, SedasimError> {
        let mut messages = Vec::new();
        if !time_min.is_finite() || time_min < 0.0 {
            messages.push(format!("time must be >= 0 min, got {time_min}"));
        }
        if !bolus_mg.is_finite() || bolus_mg < BOLUS_RANGE.0 || bolus_mg > BOLUS_RANGE.1 {
            messages.push(format!(
                "bolus must be within {}..{} mg, got {}",
                BOLUS_RANGE.0, BOLUS_RANGE.1, bolus_mg
            ));
        }
        if !rate_mg_per_hr.is_finite()
            || rate_mg_per_hr < RATE_RANGE.0
            || rate_mg_per_hr > RATE_RANGE.1
        {
            messages.push(format!(
                "continuous rate must be within {}..{} mg/hr, got {}",
                RATE_RANGE.0, RATE_RANGE.1, rate_mg_per_hr
            ));
        }
        if !messages.is_empty() {
            return Err(SedasimError::InvalidDoseEvent { messages });
        }
        Ok(DoseEvent {
            time_min,
            bolus_mg,
            rate_mg_per_hr,
        })
    }

    /// Create a dose event from a wall-clock entry "HH:MM".
    ///
    /// The clock time is converted to minutes since `start`; entries
    /// earlier than the start are taken to be on the following day.
    pub fn at_clock_time(
        start: NaiveTime,
        clock: &str,
        bolus_mg: f64,
        rate_mg_per_hr: f64,
    ) -> Result<Self, SedasimError> {
        let time_min = minutes_from_start(start, clock)?;
        DoseEvent::new(time_min, bolus_mg, rate_mg_per_hr)
    }

    pub fn time_min(&self) -> f64 {
        self.time_min
    }

    pub fn bolus_mg(&self) -> f64 {
        self.bolus_mg
    }

    pub fn rate_mg_per_hr(&self) -> f64 {
        self.rate_mg_per_hr
    }
}

impl fmt::Display for DoseEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "t = {:.1} min: bolus {:.1} mg, continuous {:.1} mg/hr",
            self.time_min, self.bolus_mg, self.rate_mg_per_hr
        )
    }
}

/// Convert a wall-clock "HH:MM" entry to minutes since `start`, wrapping
/// past midnight by adding a day.
pub fn minutes_from_start(start: NaiveTime, clock: &str) -> Result<f64, SedasimError> {
    let time = NaiveTime::parse_from_str(clock, "%H:%M")
        .map_err(|_| SedasimError::InvalidClockTime(clock.to_string()))?;
    let delta = time.signed_duration_since(start).num_minutes() as f64;
    Ok(if delta < 0.0 { delta + 1440.0 } else { delta })
}

/// An instantaneous dose in the materialized driving streams.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BolusDose {
    pub time_min: f64,
    pub amount_mg: f64,
}

/// A piecewise-constant infusion-rate level in the materialized streams.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RateStep {
    pub time_min: f64,
    pub rate_mg_per_hr: f64,
}

/// The integrator-facing reduction of a [DoseSchedule].
///
/// The bolus declared at t = 0 is exported separately: it becomes the
/// initial condition of the central compartment and must never be
/// re-applied during stepping.
#[derive(Debug, Clone, PartialEq)]
pub struct DoseStreams {
    initial_bolus_mg: f64,
    boluses: Vec<BolusDose>,
    rate_steps: Vec<RateStep>,
}

impl DoseStreams {
    pub fn initial_bolus_mg(&self) -> f64 {
        self.initial_bolus_mg
    }

    /// Boluses at t > 0, time-sorted, simultaneous doses summed.
    pub fn boluses(&self) -> &[BolusDose] {
        &self.boluses
    }

    /// Every distinct rate level, time-sorted, starting at t = 0.
    pub fn rate_steps(&self) -> &[RateStep] {
        &self.rate_steps
    }

    /// The infusion rate in force at time `t` (mg/hr).
    pub fn rate_at(&self, t_min: f64) -> f64 {
        self.rate_steps
            .iter()
            .take_while(|step| step.time_min <= t_min + TIME_EPS)
            .last()
            .map(|step| step.rate_mg_per_hr)
            .unwrap_or(0.0)
    }

}

/// An ordered list of dose events.
///
/// Events are kept in time order with stable insertion for ties; the merge
/// of simultaneous events (boluses sum, the later-declared rate wins) is
/// applied by [DoseSchedule::materialize].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DoseSchedule {
    events: Vec<DoseEvent>,
}

impl DoseSchedule {
    pub fn new() -> Self {
        DoseSchedule::default()
    }

    /// Insert an event in time order, after any events with the same time.
    pub fn add(&mut self, event: DoseEvent) {
        let index = self
            .events
            .partition_point(|existing| existing.time_min <= event.time_min + TIME_EPS);
        self.events.insert(index, event);
    }

    /// Remove the event at `index`. Out-of-range indices are a no-op and
    /// return `None`.
    pub fn remove(&mut self, index: usize) -> Option<DoseEvent> {
        if index < self.events.len() {
            Some(self.events.remove(index))
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn events(&self) -> &[DoseEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The time of the last event, or 0 for an empty schedule.
    pub fn max_event_time(&self) -> f64 {
        self.events.last().map(|e| e.time_min).unwrap_or(0.0)
    }

    /// The dose event in force at `t_min`, if any lies within `half_window`
    /// minutes of it.
    pub fn event_near(&self, t_min: f64, half_window: f64) -> Option<&DoseEvent> {
        self.events
            .iter()
            .filter(|e| (e.time_min - t_min).abs() <= half_window)
            .min_by(|a, b| {
                (a.time_min - t_min)
                    .abs()
                    .partial_cmp(&(b.time_min - t_min).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Reduce the schedule to bolus and rate-step streams.
    ///
    /// Simultaneous boluses are summed; of simultaneous rate declarations
    /// the later-added wins. The rate stream always starts at t = 0, with
    /// an explicit zero level if the schedule does not define one.
    pub fn materialize(&self) -> DoseStreams {
        let mut initial_bolus_mg = 0.0;
        let mut boluses: Vec<BolusDose> = Vec::new();
        let mut rate_steps: Vec<RateStep> = Vec::new();

        for event in &self.events {
            if event.bolus_mg > 0.0 {
                if event.time_min < TIME_EPS {
                    initial_bolus_mg += event.bolus_mg;
                } else if let Some(last) = boluses
                    .last_mut()
                    .filter(|b| (b.time_min - event.time_min).abs() < TIME_EPS)
                {
                    last.amount_mg += event.bolus_mg;
                } else {
                    boluses.push(BolusDose {
                        time_min: event.time_min,
                        amount_mg: event.bolus_mg,
                    });
                }
            }

            if let Some(last) = rate_steps
                .last_mut()
                .filter(|s| (s.time_min - event.time_min).abs() < TIME_EPS)
            {
                last.rate_mg_per_hr = event.rate_mg_per_hr;
            } else {
                rate_steps.push(RateStep {
                    time_min: event.time_min,
                    rate_mg_per_hr: event.rate_mg_per_hr,
                });
            }
        }

        if rate_steps.first().map(|s| s.time_min > TIME_EPS).unwrap_or(true) {
            rate_steps.insert(
                0,
                RateStep {
                    time_min: 0.0,
                    rate_mg_per_hr: 0.0,
                },
            );
        }

        DoseStreams {
            initial_bolus_mg,
            boluses,
            rate_steps,
        }
    }
}

impl fmt::Display for DoseSchedule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Dose schedule ({} events):", self.events.len())?;
        for event in &self.events {
            writeln!(f, "  {event}")?;
        }
        Ok(())
    }
}
