//! Patient table operations.

use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_datetime, parse_date, parse_datetime, parse_uuid};
use crate::db::{map_constraint, StoreResult};
use crate::models::enums::{CivilStatus, Sex};
use crate::models::patient::{Patient, PatientInput};

pub(crate) const PATIENT_COLS: &str = "id, reference_number, last_name, first_name, middle_name, \
     date_of_birth, sex, civil_status, occupation, parents, parent_contact, school, \
     contact_number, address, notes, registered_at, updated_at";

/// Reserve the next reference number. Must run inside the same transaction
/// as the insert that uses it, so interleaved creations cannot observe the
/// same value.
pub fn next_reference_number(conn: &Connection) -> StoreResult<i64> {
    let value: i64 = conn.query_row(
        "SELECT next_value FROM ref_counter WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE ref_counter SET next_value = next_value + 1 WHERE id = 1",
        [],
    )?;
    Ok(value)
}

pub fn insert_patient(conn: &Connection, patient: &Patient) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO patients (id, reference_number, last_name, first_name, middle_name,
         date_of_birth, sex, civil_status, occupation, parents, parent_contact, school,
         contact_number, address, notes, registered_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            patient.id.to_string(),
            patient.reference_number,
            patient.last_name,
            patient.first_name,
            patient.middle_name,
            patient.date_of_birth.map(|d| d.to_string()),
            patient.sex.map(|s| s.as_str()),
            patient.civil_status.map(|s| s.as_str()),
            patient.occupation,
            patient.parents,
            patient.parent_contact,
            patient.school,
            patient.contact_number,
            patient.address,
            patient.notes,
            fmt_datetime(patient.registered_at),
            fmt_datetime(patient.updated_at),
        ],
    )
    .map_err(|e| map_constraint(e, "reference number already assigned"))?;
    Ok(())
}

/// Update the mutable fields of a patient. The reference number is immutable
/// and deliberately absent from the SET list. Returns false on a miss.
pub fn update_patient(conn: &Connection, id: &Uuid, input: &PatientInput) -> StoreResult<bool> {
    let rows = conn.execute(
        "UPDATE patients SET
            last_name = ?2, first_name = ?3, middle_name = ?4, date_of_birth = ?5,
            sex = ?6, civil_status = ?7, occupation = ?8, parents = ?9,
            parent_contact = ?10, school = ?11, contact_number = ?12, address = ?13,
            notes = ?14, updated_at = datetime('now')
         WHERE id = ?1",
        params![
            id.to_string(),
            input.last_name,
            input.first_name,
            input.middle_name,
            input.date_of_birth.map(|d| d.to_string()),
            input.sex.map(|s| s.as_str()),
            input.civil_status.map(|s| s.as_str()),
            input.occupation,
            input.parents,
            input.parent_contact,
            input.school,
            input.contact_number,
            input.address,
            input.notes,
        ],
    )?;
    Ok(rows > 0)
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> StoreResult<Option<Patient>> {
    let sql = format!("SELECT {PATIENT_COLS} FROM patients WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], map_patient_row)
        .optional()?
        .map(patient_from_row)
        .transpose()
}

pub fn get_patient_by_reference(
    conn: &Connection,
    reference: i64,
) -> StoreResult<Option<Patient>> {
    let sql = format!("SELECT {PATIENT_COLS} FROM patients WHERE reference_number = ?1");
    conn.query_row(&sql, params![reference], map_patient_row)
        .optional()?
        .map(patient_from_row)
        .transpose()
}

pub fn delete_patient(conn: &Connection, id: &Uuid) -> StoreResult<bool> {
    let rows = conn.execute(
        "DELETE FROM patients WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(rows > 0)
}

/// One alphabetical page of patients plus the total count.
pub fn list_page(
    conn: &Connection,
    page: usize,
    page_size: usize,
) -> StoreResult<(Vec<Patient>, i64)> {
    let total = count_patients(conn)?;

    let offset = page.saturating_sub(1) * page_size;
    let sql = format!(
        "SELECT {PATIENT_COLS} FROM patients
         ORDER BY last_name, first_name
         LIMIT ?1 OFFSET ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![page_size as i64, offset as i64], map_patient_row)?;

    let mut patients = Vec::new();
    for row in rows {
        patients.push(patient_from_row(row?)?);
    }
    Ok((patients, total))
}

pub fn count_patients(conn: &Connection) -> StoreResult<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))?;
    Ok(count)
}

/// Every patient row (merge/import support).
pub(crate) fn all_patients(conn: &Connection) -> StoreResult<Vec<Patient>> {
    let sql = format!("SELECT {PATIENT_COLS} FROM patients ORDER BY reference_number");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_patient_row)?;

    let mut patients = Vec::new();
    for row in rows {
        patients.push(patient_from_row(row?)?);
    }
    Ok(patients)
}

/// Push the reference counter past every assigned number, so numbers adopted
/// from a merged store cannot be handed out again.
pub(crate) fn advance_ref_counter(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "UPDATE ref_counter
         SET next_value = MAX(next_value,
             COALESCE((SELECT MAX(reference_number) FROM patients), 0) + 1)
         WHERE id = 1",
        [],
    )?;
    Ok(())
}

/// Move every visit from one patient to another (record-merge support).
pub fn reassign_visits(conn: &Connection, from: &Uuid, to: &Uuid) -> StoreResult<usize> {
    let rows = conn.execute(
        "UPDATE visit_logs SET patient_id = ?2 WHERE patient_id = ?1",
        params![from.to_string(), to.to_string()],
    )?;
    Ok(rows)
}

// Internal row type for Patient mapping
pub(crate) struct PatientRow {
    id: String,
    reference_number: i64,
    last_name: String,
    first_name: String,
    middle_name: Option<String>,
    date_of_birth: Option<String>,
    sex: Option<String>,
    civil_status: Option<String>,
    occupation: Option<String>,
    parents: Option<String>,
    parent_contact: Option<String>,
    school: Option<String>,
    contact_number: Option<String>,
    address: Option<String>,
    notes: Option<String>,
    registered_at: String,
    updated_at: String,
}

pub(crate) fn map_patient_row(row: &Row<'_>) -> rusqlite::Result<PatientRow> {
    Ok(PatientRow {
        id: row.get(0)?,
        reference_number: row.get(1)?,
        last_name: row.get(2)?,
        first_name: row.get(3)?,
        middle_name: row.get(4)?,
        date_of_birth: row.get(5)?,
        sex: row.get(6)?,
        civil_status: row.get(7)?,
        occupation: row.get(8)?,
        parents: row.get(9)?,
        parent_contact: row.get(10)?,
        school: row.get(11)?,
        contact_number: row.get(12)?,
        address: row.get(13)?,
        notes: row.get(14)?,
        registered_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

pub(crate) fn patient_from_row(row: PatientRow) -> StoreResult<Patient> {
    Ok(Patient {
        id: parse_uuid(&row.id)?,
        reference_number: row.reference_number,
        last_name: row.last_name,
        first_name: row.first_name,
        middle_name: row.middle_name,
        date_of_birth: row.date_of_birth.as_deref().and_then(parse_date),
        sex: row.sex.as_deref().map(Sex::from_str).transpose()?,
        civil_status: row
            .civil_status
            .as_deref()
            .map(CivilStatus::from_str)
            .transpose()?,
        occupation: row.occupation,
        parents: row.parents,
        parent_contact: row.parent_contact,
        school: row.school,
        contact_number: row.contact_number,
        address: row.address,
        notes: row.notes,
        registered_at: parse_datetime(&row.registered_at),
        updated_at: parse_datetime(&row.updated_at),
    })
}

/// Build a full `Patient` from an input plus freshly assigned identity.
pub(crate) fn patient_from_input(
    id: Uuid,
    reference_number: i64,
    input: &PatientInput,
    now: NaiveDateTime,
) -> Patient {
    Patient {
        id,
        reference_number,
        last_name: input.last_name.trim().to_string(),
        first_name: input.first_name.trim().to_string(),
        middle_name: input.middle_name.clone(),
        date_of_birth: input.date_of_birth,
        sex: input.sex,
        civil_status: input.civil_status,
        occupation: input.occupation.clone(),
        parents: input.parents.clone(),
        parent_contact: input.parent_contact.clone(),
        school: input.school.clone(),
        contact_number: input.contact_number.clone(),
        address: input.address.clone(),
        notes: input.notes.clone(),
        registered_at: now,
        updated_at: now,
    }
}
