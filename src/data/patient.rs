use std::fmt;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::SedasimError;

/// Biological sex, as used by the covariate model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sex {
    Male,
    Female,
}

/// ASA physical status, collapsed to the two bands the covariate model
/// distinguishes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsaClass {
    #[serde(rename = "I-II")]
    IToII,
    #[serde(rename = "III-IV")]
    IIIToIV,
}

/// Admissible covariate ranges. Values outside these are rejected by
/// [Patient::new]; the model is not validated beyond them.
const AGE_RANGE: (f64, f64) = (1.0, 100.0);
const WEIGHT_RANGE: (f64, f64) = (3.0, 200.0);
const HEIGHT_RANGE: (f64, f64) = (70.0, 220.0);

/// An individual patient description.
///
/// A [Patient] is immutable over the lifetime of a simulation run: it is
/// validated once at construction, and the derived PK/PD parameters are
/// computed from it by [crate::model::derive_parameters]. Simulators hold
/// the patient by value and never mutate it.
///
/// # Examples
///
/// ```
/// use sedasim::prelude::*;
///
/// let patient = Patient::builder("case_042")
///     .age(52.0)
///     .weight(68.0)
///     .height(162.0)
///     .sex(Sex::Female)
///     .opioid(true)
///     .build()
///     .unwrap();
/// assert!(patient.bmi() > 20.0);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Patient {
    id: String,
    age_y: f64,
    weight_kg: f64,
    height_cm: f64,
    sex: Sex,
    asa: AsaClass,
    opioid: bool,
    anesthesia_start: Option<NaiveTime>,
}

impl Patient {
    /// Create a validated patient.
    ///
    /// Returns [SedasimError::InvalidPatient] carrying one message per
    /// out-of-range covariate; the messages are ordered by field.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        age_y: f64,
        weight_kg: f64,
        height_cm: f64,
        sex: Sex,
        asa: AsaClass,
        opioid: bool,
        anesthesia_start: Option<NaiveTime>,
    ) -> Result<Self, SedasimError> {
        let mut messages = Vec::new();
        if !age_y.is_finite() || age_y < AGE_RANGE.0 || age_y > AGE_RANGE.1 {
            messages.push(format!(
                "age must be within {}..{} years, got {}",
                AGE_RANGE.0, AGE_RANGE.1, age_y
            ));
        }
        if !weight_kg.is_finite() || weight_kg < WEIGHT_RANGE.0 || weight_kg > WEIGHT_RANGE.1 {
            messages.push(format!(
                "weight must be within {}..{} kg, got {}",
                WEIGHT_RANGE.0, WEIGHT_RANGE.1, weight_kg
            ));
        }
        if !height_cm.is_finite() || height_cm < HEIGHT_RANGE.0 || height_cm > HEIGHT_RANGE.1 {
            messages.push(format!(
                "height must be within {}..{} cm, got {}",
                HEIGHT_RANGE.0, HEIGHT_RANGE.1, height_cm
            ));
        }
        if !messages.is_empty() {
            return Err(SedasimError::InvalidPatient { messages });
        }
        Ok(Patient {
            id: id.into(),
            age_y,
            weight_kg,
            height_cm,
            sex,
            asa,
            opioid,
            anesthesia_start,
        })
    }

    /// Start building a patient. Covariates default to the reference
    /// individual of the published model.
    pub fn builder(id: impl Into<String>) -> PatientBuilder {
        PatientBuilder {
            id: id.into(),
            age_y: 35.0,
            weight_kg: 70.0,
            height_cm: 170.0,
            sex: Sex::Male,
            asa: AsaClass::IToII,
            opioid: false,
            anesthesia_start: None,
        }
    }

    /// The reference individual of the published model: a 35-year-old,
    /// 70 kg, 170 cm male, ASA I-II, with opioid co-administration.
    pub fn reference() -> Self {
        Patient {
            id: "reference".to_string(),
            age_y: 35.0,
            weight_kg: 70.0,
            height_cm: 170.0,
            sex: Sex::Male,
            asa: AsaClass::IToII,
            opioid: true,
            anesthesia_start: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age_y(&self) -> f64 {
        self.age_y
    }

    pub fn weight_kg(&self) -> f64 {
        self.weight_kg
    }

    pub fn height_cm(&self) -> f64 {
        self.height_cm
    }

    pub fn sex(&self) -> Sex {
        self.sex
    }

    pub fn asa(&self) -> AsaClass {
        self.asa
    }

    pub fn opioid(&self) -> bool {
        self.opioid
    }

    pub fn anesthesia_start(&self) -> Option<NaiveTime> {
        self.anesthesia_start
    }

    /// Body mass index in kg/m².
    pub fn bmi(&self) -> f64 {
        let height_m = self.height_cm / 100.0;
        self.weight_kg / (height_m * height_m)
    }

    /// Post-menstrual age in weeks, approximated for post-natal ages as
    /// age in weeks plus a 40-week gestation.
    pub fn pma_weeks(&self) -> f64 {
        self.age_y * 52.0 + 40.0
    }

    /// Fat-free mass in kg (Al-Sallami).
    pub fn ffm(&self) -> f64 {
        al_sallami_ffm(self.sex, self.age_y, self.weight_kg, self.bmi())
    }
}

/// Al-Sallami fat-free mass. Below two years of age the closed forms are
/// not applicable and FFM is taken as 82% of body weight.
fn al_sallami_ffm(sex: Sex, age_y: f64, weight_kg: f64, bmi: f64) -> f64 {
    if age_y < 2.0 {
        return 0.82 * weight_kg;
    }
    match sex {
        Sex::Male => {
            (0.88 + (1.0 - 0.88) / (1.0 + (age_y / 13.4).powf(-12.7)))
                * (9270.0 * weight_kg)
                / (6680.0 + 216.0 * bmi)
        }
        Sex::Female => {
            (1.11 + (1.0 - 1.11) / (1.0 + (age_y / 7.1).powf(-1.1)))
                * (9270.0 * weight_kg)
                / (8780.0 + 244.0 * bmi)
        }
    }
}

/// Fat-free mass of the fixed reference male (35 y, 70 kg, 170 cm).
pub(crate) fn ffm_reference() -> f64 {
    let bmi = 70.0 / (1.7 * 1.7);
    al_sallami_ffm(Sex::Male, 35.0, 70.0, bmi)
}

/// Fluent constructor for [Patient]; `build` performs the same validation
/// as [Patient::new].
pub struct PatientBuilder {
    id: String,
    age_y: f64,
    weight_kg: f64,
    height_cm: f64,
    sex: Sex,
    asa: AsaClass,
    opioid: bool,
    anesthesia_start: Option<NaiveTime>,
}

impl PatientBuilder {
    pub fn age(mut self, age_y: f64) -> Self {
        self.age_y = age_y;
        self
    }

    pub fn weight(mut self, weight_kg: f64) -> Self {
        self.weight_kg = weight_kg;
        self
    }

    pub fn height(mut self, height_cm: f64) -> Self {
        self.height_cm = height_cm;
        self
    }

    pub fn sex(mut self, sex: Sex) -> Self {
        self.sex = sex;
        self
    }

    pub fn asa(mut self, asa: AsaClass) -> Self {
        self.asa = asa;
        self
    }

    pub fn opioid(mut self, opioid: bool) -> Self {
        self.opioid = opioid;
        self
    }

    pub fn anesthesia_start(mut self, start: NaiveTime) -> Self {
        self.anesthesia_start = Some(start);
        self
    }

    pub fn build(self) -> Result<Patient, SedasimError> {
        Patient::new(
            self.id,
            self.age_y,
            self.weight_kg,
            self.height_cm,
            self.sex,
            self.asa,
            self.opioid,
            self.anesthesia_start,
        )
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sex::Male => write!(f, "Male"),
            Sex::Female => write!(f, "Female"),
        }
    }
}

impl fmt::Display for AsaClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AsaClass::IToII => write!(f, "I-II"),
            AsaClass::IIIToIV => write!(f, "III-IV"),
        }
    }
}

impl fmt::Display for Patient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Patient {}: {:.0} y, {:.1} kg, {:.0} cm, {}, ASA {}, opioid {}",
            self.id,
            self.age_y,
            self.weight_kg,
            self.height_cm,
            self.sex,
            self.asa,
            if self.opioid { "yes" } else { "no" }
        )
    }
}
