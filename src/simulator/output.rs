//! Observation series and the CSV export of a monitoring run.

use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::data::DoseEvent;
use crate::simulator::monitoring::MonitoringResult;
use crate::SedasimError;

/// Parallel observation arrays sampled on a regular grid.
///
/// The monitoring simulator fills it on the 1-minute grid and attaches the
/// dose event active near each sample; the protocol optimizer fills it on
/// its scan grid with no attachments.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    t_min: Vec<f64>,
    plasma_ug_per_ml: Vec<f64>,
    ce_ug_per_ml: Vec<f64>,
    rate_mg_per_hr: Vec<f64>,
    bis: Vec<f64>,
    events: Vec<Option<DoseEvent>>,
}

impl TimeSeries {
    pub fn new() -> Self {
        TimeSeries::default()
    }

    pub fn push(
        &mut self,
        t_min: f64,
        plasma_ug_per_ml: f64,
        ce_ug_per_ml: f64,
        rate_mg_per_hr: f64,
        bis: f64,
        event: Option<DoseEvent>,
    ) {
        self.t_min.push(t_min);
        self.plasma_ug_per_ml.push(plasma_ug_per_ml);
        self.ce_ug_per_ml.push(ce_ug_per_ml);
        self.rate_mg_per_hr.push(rate_mg_per_hr);
        self.bis.push(bis);
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.t_min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t_min.is_empty()
    }

    pub fn t_min(&self) -> &[f64] {
        &self.t_min
    }

    pub fn plasma_ug_per_ml(&self) -> &[f64] {
        &self.plasma_ug_per_ml
    }

    pub fn ce_ug_per_ml(&self) -> &[f64] {
        &self.ce_ug_per_ml
    }

    pub fn rate_mg_per_hr(&self) -> &[f64] {
        &self.rate_mg_per_hr
    }

    pub fn bis(&self) -> &[f64] {
        &self.bis
    }

    pub fn events(&self) -> &[Option<DoseEvent>] {
        &self.events
    }

    pub fn max_plasma(&self) -> f64 {
        self.plasma_ug_per_ml.iter().copied().fold(0.0, f64::max)
    }

    pub fn max_ce(&self) -> f64 {
        self.ce_ug_per_ml.iter().copied().fold(0.0, f64::max)
    }

    pub fn min_bis(&self) -> f64 {
        self.bis.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Mean of `ce` over samples with t in `[from_min, to_min]`; `None`
    /// when the window holds no samples.
    pub fn mean_ce_between(&self, from_min: f64, to_min: f64) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for (t, ce) in self.t_min.iter().zip(&self.ce_ug_per_ml) {
            if *t >= from_min && *t <= to_min {
                sum += ce;
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }

    /// `ce` at the sample closest to `t_min`.
    pub fn ce_at(&self, t_min: f64) -> Option<f64> {
        self.t_min
            .iter()
            .enumerate()
            .min_by(|a, b| {
                (a.1 - t_min)
                    .abs()
                    .partial_cmp(&(b.1 - t_min).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| self.ce_ug_per_ml[i])
    }
}

fn format_value(value: f64, decimals: usize) -> String {
    if value.is_finite() {
        format!("{value:.decimals$}")
    } else {
        "N/A".to_string()
    }
}

fn format_time(t_min: f64, anesthesia_start: Option<NaiveTime>) -> String {
    match anesthesia_start {
        Some(start) => {
            let clock = start + Duration::seconds((t_min * 60.0).round() as i64);
            clock.format("%H:%M").to_string()
        }
        None => format!("{}", t_min.round() as i64),
    }
}

impl MonitoringResult {
    /// Serialize the run to the CSV exchange format: a patient-attribute
    /// line, the column header, then one row per 1-minute sample.
    pub fn to_csv(&self) -> Result<String, SedasimError> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());

        let patient = &self.patient;
        writer.write_record([
            format!("Patient ID:{}", patient.id()),
            format!("Age:{:.0} years", patient.age_y()),
            format!("Weight:{:.1} kg", patient.weight_kg()),
            format!("Height:{:.0} cm", patient.height_cm()),
            format!("Sex:{}", patient.sex()),
            format!("ASA:{}", patient.asa()),
            format!("Opioid:{}", if patient.opioid() { "Yes" } else { "No" }),
            format!(
                "Anesthesia Start:{}",
                patient
                    .anesthesia_start()
                    .map(|t| t.format("%H:%M").to_string())
                    .unwrap_or_else(|| "N/A".to_string())
            ),
        ])?;

        writer.write_record([
            "Time",
            "Predicted Plasma Conc.(µg/mL)",
            "Predicted Effect-site Conc.(µg/mL)",
            "Predicted BIS Value",
        ])?;

        let series = &self.time_series;
        for i in 0..series.len() {
            writer.write_record([
                format_time(series.t_min()[i], patient.anesthesia_start()),
                format_value(series.plasma_ug_per_ml()[i], 3),
                format_value(series.ce_ug_per_ml()[i], 3),
                format_value(series.bis()[i], 1),
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| SedasimError::CsvExport(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| SedasimError::CsvExport(e.to_string()))
    }
}

/// Numeric series recovered from an exported CSV.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSeries {
    pub t_min: Vec<f64>,
    pub plasma_ug_per_ml: Vec<f64>,
    pub ce_ug_per_ml: Vec<f64>,
    pub bis: Vec<f64>,
}

/// Parse a CSV export back into its numeric series.
///
/// Wall-clock times are resolved against the anesthesia start recorded in
/// the attribute line, wrapping past midnight.
pub fn parse_csv(text: &str) -> Result<ParsedSeries, SedasimError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let attributes = records
        .next()
        .ok_or_else(|| SedasimError::CsvParse("missing patient attribute line".to_string()))?
        .map_err(|e| SedasimError::CsvParse(e.to_string()))?;
    let anesthesia_start = attributes
        .iter()
        .find_map(|field| field.strip_prefix("Anesthesia Start:"))
        .filter(|value| *value != "N/A")
        .map(|value| {
            NaiveTime::parse_from_str(value, "%H:%M")
                .map_err(|_| SedasimError::CsvParse(format!("bad anesthesia start '{value}'")))
        })
        .transpose()?;

    records
        .next()
        .ok_or_else(|| SedasimError::CsvParse("missing column header line".to_string()))?
        .map_err(|e| SedasimError::CsvParse(e.to_string()))?;

    let mut series = ParsedSeries::default();
    let mut previous_t = f64::NEG_INFINITY;
    let mut day_offset = 0.0;
    for record in records {
        let record = record.map_err(|e| SedasimError::CsvParse(e.to_string()))?;
        if record.len() < 4 {
            return Err(SedasimError::CsvParse(format!(
                "expected 4 columns, got {}",
                record.len()
            )));
        }
        let t_min = match anesthesia_start {
            Some(start) => {
                let clock = NaiveTime::parse_from_str(&record[0], "%H:%M")
                    .map_err(|_| SedasimError::CsvParse(format!("bad time '{}'", &record[0])))?;
                let mut t = clock.signed_duration_since(start).num_minutes() as f64 + day_offset;
                if t < previous_t {
                    day_offset += 1440.0;
                    t += 1440.0;
                }
                t
            }
            None => record[0]
                .parse::<f64>()
                .map_err(|_| SedasimError::CsvParse(format!("bad time '{}'", &record[0])))?,
        };
        previous_t = t_min;
        series.t_min.push(t_min);
        series.plasma_ug_per_ml.push(parse_value(&record[1])?);
        series.ce_ug_per_ml.push(parse_value(&record[2])?);
        series.bis.push(parse_value(&record[3])?);
    }
    Ok(series)
}

fn parse_value(field: &str) -> Result<f64, SedasimError> {
    if field == "N/A" {
        return Ok(f64::NAN);
    }
    field
        .parse::<f64>()
        .map_err(|_| SedasimError::CsvParse(format!("bad numeric field '{field}'")))
}
