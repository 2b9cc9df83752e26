//! CSV export. Streams rows straight from the store to disk with a stable
//! column order; never materializes the full result set in memory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::db::StoreResult;
use crate::models::filters::PatientFilter;
use crate::search::{for_each_hit, CancelToken};

/// Column order for `export_patients_csv`. Stable — consumers key on it.
pub const PATIENT_CSV_HEADER: &str = "Reference,Last Name,First Name,Middle Name,\
Date of Birth,Age,Sex,Civil Status,Occupation,Parents,Parent Contact,School,\
Contact,Address,Notes,Registered,Last Visit";

/// Column order for `export_visits_csv`. Stable — consumers key on it.
pub const VISIT_CSV_HEADER: &str = "Reference,Last Name,First Name,Middle Name,\
DOB,Sex,Civil Status,Occupation,Parents,Parent Contact,School,Contact,Address,\
Visit Date,Time,Weight (kg),Height (cm),BP,Temp (C),Notes,Type,Recorded";

/// Stream the patients matching `filter` to a CSV file. Returns the number
/// of data rows written. On cancellation or error the partial file is
/// removed — a canceled export leaves nothing behind.
pub(crate) fn export_patients_csv(
    conn: &Connection,
    filter: &PatientFilter,
    dest: &Path,
    cancel: &CancelToken,
) -> StoreResult<u64> {
    let result = write_patients(conn, filter, dest, cancel);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn write_patients(
    conn: &Connection,
    filter: &PatientFilter,
    dest: &Path,
    cancel: &CancelToken,
) -> StoreResult<u64> {
    cancel.check()?;
    let mut writer = BufWriter::new(File::create(dest)?);
    writeln!(writer, "{PATIENT_CSV_HEADER}")?;

    let rows = for_each_hit(conn, filter, cancel, |hit| {
        let p = &hit.patient;
        let fields = [
            p.reference_number.to_string(),
            p.last_name.clone(),
            p.first_name.clone(),
            p.middle_name.clone().unwrap_or_default(),
            p.date_of_birth.map(|d| d.to_string()).unwrap_or_default(),
            hit.age.map(|a| a.to_string()).unwrap_or_default(),
            p.sex.map(|s| s.as_str().to_string()).unwrap_or_default(),
            p.civil_status
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            p.occupation.clone().unwrap_or_default(),
            p.parents.clone().unwrap_or_default(),
            p.parent_contact.clone().unwrap_or_default(),
            p.school.clone().unwrap_or_default(),
            p.contact_number.clone().unwrap_or_default(),
            p.address.clone().unwrap_or_default(),
            p.notes.clone().unwrap_or_default(),
            p.registered_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            hit.last_visit.map(|d| d.to_string()).unwrap_or_default(),
        ];
        write_record(&mut writer, &fields)
    })?;

    writer.flush()?;
    tracing::info!("exported {rows} patient rows to {}", dest.display());
    Ok(rows)
}

/// Stream the full visit log, joined with patient details, newest first —
/// the clinic's paper log book as one file.
pub(crate) fn export_visits_csv(
    conn: &Connection,
    dest: &Path,
    cancel: &CancelToken,
) -> StoreResult<u64> {
    let result = write_visits(conn, dest, cancel);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn write_visits(conn: &Connection, dest: &Path, cancel: &CancelToken) -> StoreResult<u64> {
    cancel.check()?;
    let mut writer = BufWriter::new(File::create(dest)?);
    writeln!(writer, "{VISIT_CSV_HEADER}")?;

    let mut stmt = conn.prepare(
        "SELECT p.reference_number, p.last_name, p.first_name, p.middle_name,
                p.date_of_birth, p.sex, p.civil_status, p.occupation, p.parents,
                p.parent_contact, p.school, p.contact_number, p.address,
                v.visit_date, v.visit_time, v.weight_kg, v.height_cm,
                v.blood_pressure, v.temperature_celsius, v.notes, v.visit_type,
                v.created_at
         FROM visit_logs v
         JOIN patients p ON v.patient_id = p.id
         ORDER BY v.visit_date DESC, v.visit_time DESC",
    )?;

    let column_count = stmt.column_count();
    let mut rows = stmt.query([])?;
    let mut written = 0u64;
    while let Some(row) = rows.next()? {
        cancel.check()?;
        let fields: Vec<String> = (0..column_count)
            .map(|i| field_text(row.get_ref(i)))
            .collect::<rusqlite::Result<_>>()?;
        write_record(&mut writer, &fields)?;
        written += 1;
    }

    writer.flush()?;
    tracing::info!("exported {written} visit rows to {}", dest.display());
    Ok(written)
}

fn field_text(value: rusqlite::Result<ValueRef<'_>>) -> rusqlite::Result<String> {
    Ok(match value? {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(_) => String::new(),
    })
}

fn write_record(writer: &mut impl Write, fields: &[String]) -> StoreResult<()> {
    let line = fields
        .iter()
        .map(|f| escape_csv(f))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(writer, "{line}")?;
    Ok(())
}

/// Escape a string for CSV output.
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
