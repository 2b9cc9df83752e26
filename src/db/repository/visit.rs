//! Visit-log table operations.

use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_datetime, parse_date, parse_datetime, parse_time, parse_uuid};
use crate::db::StoreResult;
use crate::models::enums::VisitType;
use crate::models::filters::DateRange;
use crate::models::visit::{Visit, VisitDetail, VisitInput, VisitSummary};

const VISIT_COLS: &str = "v.id, v.patient_id, v.visit_date, v.visit_time, v.weight_kg, \
     v.height_cm, v.blood_pressure, v.temperature_celsius, v.notes, v.visit_type, \
     v.created_at, v.modified_at";

/// Patient display name, last name first, middle name when present.
const PATIENT_NAME_EXPR: &str = "(p.last_name || ', ' || p.first_name || \
     CASE WHEN p.middle_name IS NOT NULL THEN ' ' || p.middle_name ELSE '' END)";

pub fn insert_visit(conn: &Connection, visit: &Visit) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO visit_logs (id, patient_id, visit_date, visit_time, weight_kg,
         height_cm, blood_pressure, temperature_celsius, notes, visit_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            visit.id.to_string(),
            visit.patient_id.to_string(),
            visit.visit_date.to_string(),
            visit.visit_time.map(|t| t.format("%H:%M:%S").to_string()),
            visit.weight_kg,
            visit.height_cm,
            visit.blood_pressure,
            visit.temperature_celsius,
            visit.notes,
            visit.visit_type.as_str(),
            fmt_datetime(visit.created_at),
        ],
    )?;
    Ok(())
}

/// Rewrite a visit's fields, stamping `modified_at`. Returns false on a miss.
pub fn update_visit(conn: &Connection, id: &Uuid, input: &VisitInput) -> StoreResult<bool> {
    let rows = conn.execute(
        "UPDATE visit_logs SET
            patient_id = ?2, visit_date = ?3, visit_time = ?4, weight_kg = ?5,
            height_cm = ?6, blood_pressure = ?7, temperature_celsius = ?8,
            notes = ?9, visit_type = ?10, modified_at = datetime('now')
         WHERE id = ?1",
        params![
            id.to_string(),
            input.patient_id.to_string(),
            input.visit_date.to_string(),
            input.visit_time.map(|t| t.format("%H:%M:%S").to_string()),
            input.weight_kg,
            input.height_cm,
            input.blood_pressure,
            input.temperature_celsius,
            input.notes,
            input.visit_type.as_str(),
        ],
    )?;
    Ok(rows > 0)
}

pub fn get_visit(conn: &Connection, id: &Uuid) -> StoreResult<Option<Visit>> {
    let sql = format!("SELECT {VISIT_COLS} FROM visit_logs v WHERE v.id = ?1");
    conn.query_row(&sql, params![id.to_string()], map_visit_row)
        .optional()?
        .map(visit_from_row)
        .transpose()
}

/// A visit joined with its patient's name and reference number.
pub fn get_visit_detail(conn: &Connection, id: &Uuid) -> StoreResult<Option<VisitDetail>> {
    let sql = format!(
        "SELECT {VISIT_COLS}, {PATIENT_NAME_EXPR} AS patient_name, p.reference_number
         FROM visit_logs v
         JOIN patients p ON v.patient_id = p.id
         WHERE v.id = ?1"
    );
    conn.query_row(&sql, params![id.to_string()], map_detail_row)
        .optional()?
        .map(detail_from_row)
        .transpose()
}

pub fn delete_visit(conn: &Connection, id: &Uuid) -> StoreResult<bool> {
    let rows = conn.execute(
        "DELETE FROM visit_logs WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(rows > 0)
}

/// Visit dates of every visit belonging to a patient. Used to invalidate the
/// affected day buckets before a cascade delete or a merge.
pub fn visit_dates_for_patient(conn: &Connection, patient_id: &Uuid) -> StoreResult<Vec<NaiveDate>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT visit_date FROM visit_logs WHERE patient_id = ?1")?;
    let rows = stmt.query_map(params![patient_id.to_string()], |row| {
        row.get::<_, String>(0)
    })?;

    let mut dates = Vec::new();
    for row in rows {
        if let Some(date) = parse_date(&row?) {
            dates.push(date);
        }
    }
    Ok(dates)
}

/// One page of a patient's visit history, newest first, with optional date
/// bounds.
pub fn visits_for_patient_page(
    conn: &Connection,
    patient_id: &Uuid,
    range: DateRange,
    page: usize,
    page_size: usize,
) -> StoreResult<(Vec<Visit>, i64)> {
    let mut cond = String::from("WHERE v.patient_id = ?1");
    let mut args: Vec<String> = vec![patient_id.to_string()];

    if let Some(from) = range.from {
        args.push(from.to_string());
        cond.push_str(&format!(" AND v.visit_date >= ?{}", args.len()));
    }
    if let Some(to) = range.to {
        args.push(to.to_string());
        cond.push_str(&format!(" AND v.visit_date <= ?{}", args.len()));
    }

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM visit_logs v {cond}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let offset = page.saturating_sub(1) * page_size;
    let sql = format!(
        "SELECT {VISIT_COLS} FROM visit_logs v {cond}
         ORDER BY v.visit_date DESC, v.visit_time DESC
         LIMIT {page_size} OFFSET {offset}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), map_visit_row)?;

    let mut visits = Vec::new();
    for row in rows {
        visits.push(visit_from_row(row?)?);
    }
    Ok((visits, total))
}

/// The day sheet: every visit on one date, joined with patient names,
/// ordered by time of day.
pub fn visits_on(conn: &Connection, date: NaiveDate) -> StoreResult<Vec<VisitDetail>> {
    let sql = format!(
        "SELECT {VISIT_COLS}, {PATIENT_NAME_EXPR} AS patient_name, p.reference_number
         FROM visit_logs v
         JOIN patients p ON v.patient_id = p.id
         WHERE v.visit_date = ?1
         ORDER BY v.visit_time, v.created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![date.to_string()], map_detail_row)?;

    let mut details = Vec::new();
    for row in rows {
        details.push(detail_from_row(row?)?);
    }
    Ok(details)
}

/// One page over the full visit log, newest first, with optional date bounds.
pub fn list_page(
    conn: &Connection,
    range: DateRange,
    page: usize,
    page_size: usize,
) -> StoreResult<(Vec<VisitDetail>, i64)> {
    let mut cond = String::from("WHERE 1=1");
    let mut args: Vec<String> = Vec::new();

    if let Some(from) = range.from {
        args.push(from.to_string());
        cond.push_str(&format!(" AND v.visit_date >= ?{}", args.len()));
    }
    if let Some(to) = range.to {
        args.push(to.to_string());
        cond.push_str(&format!(" AND v.visit_date <= ?{}", args.len()));
    }

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM visit_logs v
             JOIN patients p ON v.patient_id = p.id {cond}"
        ),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let offset = page.saturating_sub(1) * page_size;
    let sql = format!(
        "SELECT {VISIT_COLS}, {PATIENT_NAME_EXPR} AS patient_name, p.reference_number
         FROM visit_logs v
         JOIN patients p ON v.patient_id = p.id
         {cond}
         ORDER BY v.visit_date DESC, v.visit_time DESC
         LIMIT {page_size} OFFSET {offset}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), map_detail_row)?;

    let mut details = Vec::new();
    for row in rows {
        details.push(detail_from_row(row?)?);
    }
    Ok((details, total))
}

/// Per-patient visit aggregate: count plus first and last visit dates.
pub fn visit_summary(conn: &Connection, patient_id: &Uuid) -> StoreResult<VisitSummary> {
    conn.query_row(
        "SELECT COUNT(*), MIN(visit_date), MAX(visit_date)
         FROM visit_logs WHERE patient_id = ?1",
        params![patient_id.to_string()],
        |row| {
            Ok(VisitSummary {
                total_visits: row.get(0)?,
                first_visit: row
                    .get::<_, Option<String>>(1)?
                    .as_deref()
                    .and_then(parse_date),
                last_visit: row
                    .get::<_, Option<String>>(2)?
                    .as_deref()
                    .and_then(parse_date),
            })
        },
    )
    .map_err(Into::into)
}

/// Every visit row, unjoined (merge/import support).
pub(crate) fn all_visits(conn: &Connection) -> StoreResult<Vec<Visit>> {
    let sql = format!(
        "SELECT {VISIT_COLS} FROM visit_logs v ORDER BY v.visit_date, v.visit_time"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_visit_row)?;

    let mut visits = Vec::new();
    for row in rows {
        visits.push(visit_from_row(row?)?);
    }
    Ok(visits)
}

/// Duplicate check used by merge: same patient, same date, same time slot.
pub(crate) fn visit_exists_at(
    conn: &Connection,
    patient_id: &Uuid,
    date: NaiveDate,
    time: Option<chrono::NaiveTime>,
) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM visit_logs
             WHERE patient_id = ?1 AND visit_date = ?2 AND visit_time IS ?3",
            params![
                patient_id.to_string(),
                date.to_string(),
                time.map(|t| t.format("%H:%M:%S").to_string()),
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn count_visits(conn: &Connection) -> StoreResult<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM visit_logs", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_visits_on(conn: &Connection, date: NaiveDate) -> StoreResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM visit_logs WHERE visit_date = ?1",
        params![date.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Date of the most recently created encoded (paper-backfill) visit.
pub fn last_encoded_visit_date(conn: &Connection) -> StoreResult<Option<NaiveDate>> {
    let date: Option<String> = conn
        .query_row(
            "SELECT visit_date FROM visit_logs
             WHERE visit_type = 'encode'
             ORDER BY created_at DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(date.as_deref().and_then(parse_date))
}

// Internal row type for Visit mapping
struct VisitRow {
    id: String,
    patient_id: String,
    visit_date: String,
    visit_time: Option<String>,
    weight_kg: Option<f64>,
    height_cm: Option<f64>,
    blood_pressure: Option<String>,
    temperature_celsius: Option<f64>,
    notes: Option<String>,
    visit_type: String,
    created_at: String,
    modified_at: Option<String>,
}

fn map_visit_row(row: &Row<'_>) -> rusqlite::Result<VisitRow> {
    Ok(VisitRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        visit_date: row.get(2)?,
        visit_time: row.get(3)?,
        weight_kg: row.get(4)?,
        height_cm: row.get(5)?,
        blood_pressure: row.get(6)?,
        temperature_celsius: row.get(7)?,
        notes: row.get(8)?,
        visit_type: row.get(9)?,
        created_at: row.get(10)?,
        modified_at: row.get(11)?,
    })
}

fn map_detail_row(row: &Row<'_>) -> rusqlite::Result<(VisitRow, String, i64)> {
    Ok((map_visit_row(row)?, row.get(12)?, row.get(13)?))
}

fn visit_from_row(row: VisitRow) -> StoreResult<Visit> {
    Ok(Visit {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        visit_date: parse_date(&row.visit_date).unwrap_or_default(),
        visit_time: row.visit_time.as_deref().and_then(parse_time),
        weight_kg: row.weight_kg,
        height_cm: row.height_cm,
        blood_pressure: row.blood_pressure,
        temperature_celsius: row.temperature_celsius,
        notes: row.notes,
        visit_type: VisitType::from_str(&row.visit_type)?,
        created_at: parse_datetime(&row.created_at),
        modified_at: row.modified_at.as_deref().map(parse_datetime),
    })
}

fn detail_from_row(
    (row, patient_name, reference_number): (VisitRow, String, i64),
) -> StoreResult<VisitDetail> {
    Ok(VisitDetail {
        visit: visit_from_row(row)?,
        patient_name,
        reference_number,
    })
}

/// Build a full `Visit` from an input plus freshly assigned identity.
pub(crate) fn visit_from_input(
    id: Uuid,
    input: &VisitInput,
    now: chrono::NaiveDateTime,
) -> Visit {
    Visit {
        id,
        patient_id: input.patient_id,
        visit_date: input.visit_date,
        visit_time: input.visit_time,
        weight_kg: input.weight_kg,
        height_cm: input.height_cm,
        blood_pressure: input.blood_pressure.clone(),
        temperature_celsius: input.temperature_celsius,
        notes: input.notes.clone(),
        visit_type: input.visit_type,
        created_at: now,
        modified_at: None,
    }
}
