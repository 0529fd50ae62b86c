//! Deterministic PK/PD simulation and infusion-protocol design for an
//! intravenously administered sedative-hypnotic.
//!
//! The crate derives per-patient pharmacokinetic and pharmacodynamic
//! constants from covariates, advances a three-compartment + effect-site
//! model under arbitrary bolus/infusion histories, and designs step-down
//! infusion protocols holding a target effect-site concentration.
//!
//! Everything is deterministic: two runs with the same patient and dose
//! history produce bitwise-identical results, and the live and offline
//! engines share one stepping kernel.

pub mod data;
pub mod error;
pub mod model;
pub mod optimize;
pub mod simulator;

pub use crate::data::{DoseEvent, DoseSchedule, Patient};
pub use crate::model::{derive_parameters, DerivedParams, PdParams, PkParams};
pub use crate::optimize::{optimize_protocol, ProtocolResult, ProtocolSettings};
pub use crate::simulator::induction::InductionSimulator;
pub use crate::simulator::monitoring::MonitoringResult;
pub use error::SedasimError;

/// Prelude module that re-exports all commonly used types.
///
/// Use `use sedasim::prelude::*;` to import everything needed for basic
/// simulation and protocol design.
///
/// # Example
/// ```rust
/// use sedasim::prelude::*;
///
/// let patient = Patient::reference();
/// let mut schedule = DoseSchedule::new();
/// schedule.add(DoseEvent::new(0.0, 140.0, 200.0).unwrap());
/// let result = monitoring::simulate(&patient, &schedule, None).unwrap();
/// assert!(result.max_ce_ug_per_ml > 0.0);
/// ```
pub mod prelude {
    pub use crate::error::SedasimError;

    pub use crate::data::{
        minutes_from_start, AsaClass, BolusDose, DoseEvent, DoseSchedule, DoseStreams, Patient,
        PatientBuilder, RateStep, Sex,
    };

    pub use crate::model::{derive_parameters, DerivedParams, PdParams, PkParams};

    pub use crate::simulator::{
        induction::{InductionSimulator, LiveObservables, Snapshot, SNAPSHOT_RING_CAPACITY},
        mg_per_hr_to_mg_per_min, monitoring,
        monitoring::MonitoringResult,
        output::{parse_csv, ParsedSeries, TimeSeries},
        step_euler, step_rk4, CompartmentState, IntegrationMethod, Integrator, DT_LIVE_MIN,
        DT_PROTOCOL_MIN, TICK_INTERVAL_MS,
    };

    pub use crate::optimize::{
        optimize_protocol, AdjustmentEvent, ChartPayload, PerformanceMetrics, ProtocolResult,
        ProtocolSchedule, ProtocolSettings, ScheduleRow,
    };
}
