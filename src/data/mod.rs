pub mod patient;
pub mod schedule;

pub use patient::{AsaClass, Patient, PatientBuilder, Sex};
pub use schedule::{minutes_from_start, BolusDose, DoseEvent, DoseSchedule, DoseStreams, RateStep};
