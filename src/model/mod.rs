//! Covariate-driven derivation of per-patient PK and PD constants.
//!
//! The constants are the published population estimates for the
//! three-compartment sedative-hypnotic model; they are treated as opaque
//! numbers here. All covariate effects are normalized to the reference
//! individual (35 y, 70 kg, 170 cm male), so the reference derives the
//! published values exactly.

use serde::{Deserialize, Serialize};

use crate::data::patient::{ffm_reference, Patient, Sex};
use crate::SedasimError;

mod constants {
    //! Published population estimates.

    pub const V1_REF: f64 = 6.28; // L
    pub const V2_REF: f64 = 25.5; // L
    pub const V3_REF: f64 = 273.0; // L
    pub const CL_MALE: f64 = 1.79; // L/min
    pub const CL_FEMALE: f64 = 2.10; // L/min
    pub const Q2_REF: f64 = 1.75; // L/min
    pub const Q3_REF: f64 = 1.11; // L/min
    pub const CL_MATURATION_E50: f64 = 42.3; // weeks PMA
    pub const CL_MATURATION_SLOPE: f64 = 9.06;
    pub const V2_AGEING: f64 = -0.0156; // 1/year
    pub const CL_OPIOID: f64 = -0.00286; // 1/year
    pub const V1_WEIGHT_E50: f64 = 33.6; // kg
    pub const V3_OPIOID: f64 = -0.0138; // 1/year
    pub const Q_MATURATION_E50: f64 = 68.3; // weeks PMA
    pub const Q2_IMMATURITY: f64 = 1.30;

    pub const CE50: f64 = 3.08; // ug/mL
    pub const CE50_AGEING: f64 = -0.00635; // 1/year
    pub const KE0: f64 = 0.146; // 1/min
    pub const BIS_BASELINE: f64 = 93.0;
    pub const GAMMA_LOW: f64 = 1.89; // Ce below Ce50
    pub const GAMMA_HIGH: f64 = 1.47; // Ce at or above Ce50

    pub const AGE_REF_Y: f64 = 35.0;
    pub const PMA_REF_WEEKS: f64 = 35.0 * 52.0 + 40.0;
}

use constants::*;

/// Advisory bands; values outside them derive successfully with a warning.
const KE0_ADVISORY: (f64, f64) = (0.05, 1.0);
const CE50_ADVISORY: (f64, f64) = (0.5, 10.0);

/// Pharmacokinetic constants of the three-compartment model.
///
/// Volumes in L, clearances in L/min, ke0 in 1/min. All strictly positive
/// for any value produced by [derive_parameters].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PkParams {
    pub v1: f64,
    pub v2: f64,
    pub v3: f64,
    pub cl: f64,
    pub q2: f64,
    pub q3: f64,
    pub ke0: f64,
}

impl PkParams {
    pub fn k10(&self) -> f64 {
        self.cl / self.v1
    }

    pub fn k12(&self) -> f64 {
        self.q2 / self.v1
    }

    pub fn k21(&self) -> f64 {
        self.q2 / self.v2
    }

    pub fn k13(&self) -> f64 {
        self.q3 / self.v1
    }

    pub fn k31(&self) -> f64 {
        self.q3 / self.v3
    }
}

/// Pharmacodynamic constants of the sedation-depth model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PdParams {
    /// Effect-site concentration of half-maximal effect, ug/mL.
    pub ce50: f64,
    /// Plasma/effect-site equilibration constant, 1/min.
    pub ke0: f64,
    /// Awake index value.
    pub bis_baseline: f64,
    /// Hill exponent below ce50.
    pub gamma_low: f64,
    /// Hill exponent at and above ce50.
    pub gamma_high: f64,
}

impl PdParams {
    /// Depth-of-sedation index for an effect-site concentration.
    ///
    /// Sigmoidal Emax with an asymmetric exponent; exactly `bis_baseline`
    /// at ce = 0, strictly decreasing, bounded below by 0.
    pub fn bis(&self, ce_ug_per_ml: f64) -> f64 {
        if ce_ug_per_ml <= 0.0 {
            return self.bis_baseline;
        }
        let gamma = if ce_ug_per_ml < self.ce50 {
            self.gamma_low
        } else {
            self.gamma_high
        };
        let effect = ce_ug_per_ml.powf(gamma)
            / (ce_ug_per_ml.powf(gamma) + self.ce50.powf(gamma));
        (self.bis_baseline * (1.0 - effect)).max(0.0)
    }
}

/// The immutable parameter bundle a simulator is constructed with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DerivedParams {
    pub pk: PkParams,
    pub pd: PdParams,
}

/// `x^lambda / (x^lambda + e50^lambda)`.
fn sigmoid(x: f64, e50: f64, lambda: f64) -> f64 {
    let num = x.powf(lambda);
    num / (num + e50.powf(lambda))
}

/// Exponential ageing effect, centred on the reference age.
fn ageing(theta: f64, age_y: f64) -> f64 {
    (theta * (age_y - AGE_REF_Y)).exp()
}

/// Opioid co-administration effect; unity when no opioid is given.
fn opioid_effect(theta: f64, age_y: f64, opioid: bool) -> f64 {
    if opioid {
        ageing(theta, age_y)
    } else {
        1.0
    }
}

/// Derive the PK and PD parameter bundle for a patient.
///
/// Fails with [SedasimError::ParameterDerivation] if any derived value is
/// non-positive or non-finite. Values outside the advisory bands for ke0
/// and ce50 derive successfully but log a warning; callers MUST NOT use a
/// bundle from a failed derive.
pub fn derive_parameters(patient: &Patient) -> Result<DerivedParams, SedasimError> {
    let age = patient.age_y();
    let weight = patient.weight_kg();
    let pma = patient.pma_weeks();
    let opioid = patient.opioid();

    let v1 = V1_REF * sigmoid(weight, V1_WEIGHT_E50, 1.0) / sigmoid(70.0, V1_WEIGHT_E50, 1.0);
    let v2 = V2_REF * (weight / 70.0) * ageing(V2_AGEING, age);
    let v3 = V3_REF * (patient.ffm() / ffm_reference()) * opioid_effect(V3_OPIOID, age, opioid);

    let cl_sex = match patient.sex() {
        Sex::Male => CL_MALE,
        Sex::Female => CL_FEMALE,
    };
    let cl = cl_sex
        * (weight / 70.0).powf(0.75)
        * sigmoid(pma, CL_MATURATION_E50, CL_MATURATION_SLOPE)
        / sigmoid(PMA_REF_WEEKS, CL_MATURATION_E50, CL_MATURATION_SLOPE)
        * opioid_effect(CL_OPIOID, age, opioid);

    let q2 = Q2_REF
        * (v2 / V2_REF).powf(0.75)
        * (1.0 + Q2_IMMATURITY * (1.0 - sigmoid(pma, Q_MATURATION_E50, 1.0)));
    let q3 = Q3_REF * (v3 / V3_REF).powf(0.75) * sigmoid(pma, Q_MATURATION_E50, 1.0)
        / sigmoid(PMA_REF_WEEKS, Q_MATURATION_E50, 1.0);

    let ke0 = KE0 * (weight / 70.0).powf(-0.25);
    let ce50 = CE50 * ageing(CE50_AGEING, age);

    let pk = PkParams {
        v1,
        v2,
        v3,
        cl,
        q2,
        q3,
        ke0,
    };
    let pd = PdParams {
        ce50,
        ke0,
        bis_baseline: BIS_BASELINE,
        gamma_low: GAMMA_LOW,
        gamma_high: GAMMA_HIGH,
    };

    validate(&pk, &pd)?;
    Ok(DerivedParams { pk, pd })
}

fn validate(pk: &PkParams, pd: &PdParams) -> Result<(), SedasimError> {
    let checks: [(&'static str, f64); 12] = [
        ("V1", pk.v1),
        ("V2", pk.v2),
        ("V3", pk.v3),
        ("CL", pk.cl),
        ("Q2", pk.q2),
        ("Q3", pk.q3),
        ("ke0", pk.ke0),
        ("Ce50", pd.ce50),
        ("BIS baseline", pd.bis_baseline),
        ("gamma_low", pd.gamma_low),
        ("gamma_high", pd.gamma_high),
        ("PD ke0", pd.ke0),
    ];
    for (parameter, value) in checks {
        if !value.is_finite() || value <= 0.0 {
            return Err(SedasimError::ParameterDerivation { parameter, value });
        }
    }

    if pk.ke0 < KE0_ADVISORY.0 || pk.ke0 > KE0_ADVISORY.1 {
        tracing::warn!(
            ke0 = pk.ke0,
            "ke0 outside the advisory band {:?}",
            KE0_ADVISORY
        );
    }
    if pd.ce50 < CE50_ADVISORY.0 || pd.ce50 > CE50_ADVISORY.1 {
        tracing::warn!(
            ce50 = pd.ce50,
            "Ce50 outside the advisory band {:?}",
            CE50_ADVISORY
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::patient::{AsaClass, Patient};
    use approx::assert_relative_eq;

    #[test]
    fn reference_individual_derives_published_values() {
        let params = derive_parameters(&Patient::reference()).unwrap();
        let pk = params.pk;
        assert_relative_eq!(pk.v1, 6.28, max_relative = 5e-3);
        assert_relative_eq!(pk.v2, 25.5, max_relative = 5e-3);
        assert_relative_eq!(pk.v3, 273.0, max_relative = 5e-3);
        assert_relative_eq!(pk.cl, 1.79, max_relative = 5e-3);
        assert_relative_eq!(pk.q2, 1.83, max_relative = 5e-3);
        assert_relative_eq!(pk.q3, 1.11, max_relative = 5e-3);
        assert_relative_eq!(pk.ke0, 0.146, max_relative = 5e-3);

        let pd = params.pd;
        assert_relative_eq!(pd.ce50, 3.08, max_relative = 5e-3);
        assert_relative_eq!(pd.bis_baseline, 93.0);
        assert_relative_eq!(pd.gamma_low, 1.89);
        assert_relative_eq!(pd.gamma_high, 1.47);
    }

    #[test]
    fn female_clearance_is_higher() {
        let male = derive_parameters(&Patient::reference()).unwrap();
        let female = derive_parameters(
            &Patient::builder("ref_female")
                .sex(Sex::Female)
                .opioid(true)
                .build()
                .unwrap(),
        )
        .unwrap();
        assert_relative_eq!(female.pk.cl, 2.10, max_relative = 5e-3);
        // Sex only enters through clearance.
        assert_relative_eq!(female.pk.v1, male.pk.v1, max_relative = 1e-2);
        assert_relative_eq!(female.pk.v2, male.pk.v2, max_relative = 1e-2);
        assert_relative_eq!(female.pk.q2, male.pk.q2, max_relative = 1e-2);
    }

    #[test]
    fn opioid_coadministration_shrinks_v3_away_from_reference_age() {
        let with = derive_parameters(
            &Patient::builder("a").age(70.0).opioid(true).build().unwrap(),
        )
        .unwrap();
        let without = derive_parameters(
            &Patient::builder("b").age(70.0).opioid(false).build().unwrap(),
        )
        .unwrap();
        assert!(with.pk.v3 < without.pk.v3);
        assert!(with.pk.cl < without.pk.cl);
    }

    #[test]
    fn rate_constants_follow_clearances() {
        let pk = derive_parameters(&Patient::reference()).unwrap().pk;
        assert_relative_eq!(pk.k10(), pk.cl / pk.v1);
        assert_relative_eq!(pk.k12() * pk.v1, pk.k21() * pk.v2, max_relative = 1e-12);
        assert_relative_eq!(pk.k13() * pk.v1, pk.k31() * pk.v3, max_relative = 1e-12);
    }

    #[test]
    fn small_child_derives_positive_parameters() {
        let child = Patient::new(
            "child",
            1.5,
            11.0,
            80.0,
            Sex::Female,
            AsaClass::IToII,
            false,
            None,
        )
        .unwrap();
        let params = derive_parameters(&child).unwrap();
        assert!(params.pk.v1 > 0.0);
        assert!(params.pk.cl > 0.0);
        assert!(params.pk.q3 < 1.11);
    }

    #[test]
    fn bis_is_baseline_at_zero_and_strictly_decreasing() {
        let pd = derive_parameters(&Patient::reference()).unwrap().pd;
        assert_eq!(pd.bis(0.0), pd.bis_baseline);

        let mut previous = pd.bis(0.0);
        let mut ce = 0.05;
        while ce <= 10.0 * pd.ce50 {
            let bis = pd.bis(ce);
            assert!(bis < previous, "BIS not decreasing at ce = {ce}");
            assert!((0.0..=pd.bis_baseline).contains(&bis));
            previous = bis;
            ce += 0.05;
        }
    }

    #[test]
    fn bis_is_continuous_across_ce50() {
        let pd = derive_parameters(&Patient::reference()).unwrap().pd;
        let below = pd.bis(pd.ce50 - 1e-9);
        let at = pd.bis(pd.ce50);
        // Both exponents give half-maximal effect at ce50.
        assert_relative_eq!(at, pd.bis_baseline * 0.5, max_relative = 1e-9);
        assert!((below - at).abs() < 1e-6);
    }
}
