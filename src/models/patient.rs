use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{CivilStatus, Sex};
use crate::db::{StoreError, StoreResult};

/// A registered patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    /// Monotonically assigned, unique across the whole history of the store,
    /// immutable once assigned. Displayed as `00-00-01`.
    pub reference_number: i64,
    pub last_name: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub civil_status: Option<CivilStatus>,
    pub occupation: Option<String>,
    pub parents: Option<String>,
    pub parent_contact: Option<String>,
    pub school: Option<String>,
    pub contact_number: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
    pub registered_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Patient {
    /// "Santos, Maria Clara" — last name first, middle name appended when present.
    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{}, {} {}", self.last_name, self.first_name, middle),
            None => format!("{}, {}", self.last_name, self.first_name),
        }
    }

    /// Reference number in the `00-00-01` display format.
    pub fn reference_display(&self) -> String {
        format_reference(self.reference_number)
    }

    /// Completed years of age on the given date, `None` without a recorded
    /// date of birth or for a date before it.
    pub fn age_on(&self, on: NaiveDate) -> Option<u32> {
        self.date_of_birth.and_then(|dob| age_on(dob, on))
    }
}

/// Format a reference number for display: zero-padded to six digits and
/// grouped in pairs (`1` → `00-00-01`). Wider numbers print undecorated.
pub fn format_reference(reference: i64) -> String {
    let digits = format!("{reference:06}");
    if digits.len() == 6 {
        format!("{}-{}-{}", &digits[..2], &digits[2..4], &digits[4..])
    } else {
        digits
    }
}

/// Completed calendar years between `dob` and `on`.
///
/// Calendar-date arithmetic only — the result is identical regardless of
/// time of day or timezone of the evaluating machine. A Feb 29 birthday
/// completes its year on Mar 1 of non-leap years.
pub fn age_on(dob: NaiveDate, on: NaiveDate) -> Option<u32> {
    if on < dob {
        return None;
    }
    let mut age = on.year() - dob.year();
    if (on.month(), on.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    u32::try_from(age).ok()
}

/// Field set accepted for creating or updating a patient. The reference
/// number is not part of the input — it is assigned at creation and never
/// changes afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientInput {
    pub last_name: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub civil_status: Option<CivilStatus>,
    pub occupation: Option<String>,
    pub parents: Option<String>,
    pub parent_contact: Option<String>,
    pub school: Option<String>,
    pub contact_number: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
}

impl PatientInput {
    pub fn validate(&self) -> StoreResult<()> {
        if self.last_name.trim().is_empty() {
            return Err(StoreError::Validation {
                field: "last_name",
                reason: "must not be empty".into(),
            });
        }
        if self.first_name.trim().is_empty() {
            return Err(StoreError::Validation {
                field: "first_name",
                reason: "must not be empty".into(),
            });
        }
        if let Some(contact) = &self.contact_number {
            validate_contact_number(contact, "contact_number")?;
        }
        if let Some(contact) = &self.parent_contact {
            validate_contact_number(contact, "parent_contact")?;
        }
        Ok(())
    }
}

fn validate_contact_number(contact: &str, field: &'static str) -> StoreResult<()> {
    let digits = contact.chars().filter(|c| c.is_ascii_digit()).count();
    if digits == 10 || digits == 11 {
        Ok(())
    } else {
        Err(StoreError::Validation {
            field,
            reason: "must contain 10 or 11 digits".into(),
        })
    }
}
