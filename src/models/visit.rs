use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::VisitType;
use crate::db::{StoreError, StoreResult};

/// A single clinic visit. References its patient; does not own it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_date: NaiveDate,
    pub visit_time: Option<NaiveTime>,
    pub weight_kg: Option<f64>,
    pub height_cm: Option<f64>,
    pub blood_pressure: Option<String>,
    pub temperature_celsius: Option<f64>,
    pub notes: Option<String>,
    pub visit_type: VisitType,
    pub created_at: NaiveDateTime,
    pub modified_at: Option<NaiveDateTime>,
}

/// A visit joined with its patient's name, as shown on the day sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitDetail {
    pub visit: Visit,
    pub patient_name: String,
    pub reference_number: i64,
}

/// Per-patient visit aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitSummary {
    pub total_visits: i64,
    pub first_visit: Option<NaiveDate>,
    pub last_visit: Option<NaiveDate>,
}

/// Field set accepted for creating or updating a visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitInput {
    pub patient_id: Uuid,
    pub visit_date: NaiveDate,
    pub visit_time: Option<NaiveTime>,
    pub weight_kg: Option<f64>,
    pub height_cm: Option<f64>,
    pub blood_pressure: Option<String>,
    pub temperature_celsius: Option<f64>,
    pub notes: Option<String>,
    pub visit_type: VisitType,
}

impl VisitInput {
    pub fn new(patient_id: Uuid, visit_date: NaiveDate) -> Self {
        Self {
            patient_id,
            visit_date,
            visit_time: None,
            weight_kg: None,
            height_cm: None,
            blood_pressure: None,
            temperature_celsius: None,
            notes: None,
            visit_type: VisitType::New,
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        check_positive(self.weight_kg, "weight_kg")?;
        check_positive(self.height_cm, "height_cm")?;
        check_positive(self.temperature_celsius, "temperature_celsius")?;
        Ok(())
    }
}

fn check_positive(value: Option<f64>, field: &'static str) -> StoreResult<()> {
    match value {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(StoreError::Validation {
            field,
            reason: "must be a positive number".into(),
        }),
        _ => Ok(()),
    }
}
