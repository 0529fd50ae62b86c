use thiserror::Error;

/// Crate-wide error type.
///
/// Validation errors carry an ordered list of human-readable messages, one
/// per offending field, so callers can surface them directly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SedasimError {
    #[error("Invalid patient: {}", messages.join("; "))]
    InvalidPatient { messages: Vec<String> },
    #[error("Invalid dose event: {}", messages.join("; "))]
    InvalidDoseEvent { messages: Vec<String> },
    #[error("Parameter derivation failed: {parameter} = {value}")]
    ParameterDerivation { parameter: &'static str, value: f64 },
    #[error("Integrator diverged at t = {time_min:.2} min")]
    IntegratorDiverged { time_min: f64 },
    #[error("Invalid protocol settings: {}", messages.join("; "))]
    InvalidSettings { messages: Vec<String> },
    #[error("Invalid clock time '{0}', expected HH:MM")]
    InvalidClockTime(String),
    #[error("CSV export error: {0}")]
    CsvExport(String),
    #[error("CSV parse error: {0}")]
    CsvParse(String),
}

impl From<csv::Error> for SedasimError {
    fn from(error: csv::Error) -> Self {
        SedasimError::CsvExport(error.to_string())
    }
}
