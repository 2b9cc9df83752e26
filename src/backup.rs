//! Point-in-time backup and store-to-store merge.
//!
//! Backup uses SQLite's online backup API, so the copy is a consistent
//! snapshot even under WAL — a raw file copy of a live store is not.
//! Merge imports the records of another clinic's store file, skipping
//! duplicate reference numbers and already-present visits.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::repository::{patient, visit};
use crate::db::sqlite::{current_version, LATEST_VERSION};
use crate::db::{StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub backup_path: String,
    pub size_bytes: u64,
    pub created_at: String,
}

/// Copy the live store to `dest` as a consistent snapshot.
pub(crate) fn backup_to(conn: &Connection, dest: &Path) -> StoreResult<BackupReport> {
    let mut dst = Connection::open(dest).map_err(|e| StoreError::StorageUnavailable {
        path: dest.display().to_string(),
        reason: e.to_string(),
    })?;

    {
        let backup = Backup::new(conn, &mut dst)?;
        backup.run_to_completion(64, Duration::from_millis(0), None)?;
    }
    drop(dst);

    let size_bytes = std::fs::metadata(dest)?.len();
    tracing::info!("backed up store to {} ({size_bytes} bytes)", dest.display());

    Ok(BackupReport {
        backup_path: dest.display().to_string(),
        size_bytes,
        created_at: chrono::Local::now()
            .naive_local()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    })
}

/// Outcome counts for a merge. Skips are normal: they mark records the
/// destination already had.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub patients_added: u32,
    pub patients_skipped: u32,
    pub visits_added: u32,
    pub visits_skipped: u32,
}

/// Merge patients and visits from another store file into `dest`, inside a
/// single transaction. Patients whose reference number already exists are
/// skipped (their visits attach to the existing record); visits are
/// de-duplicated on (patient, date, time). Returns the report plus the
/// distinct visit dates that gained rows, for day-bucket invalidation.
pub(crate) fn merge_from(
    dest: &mut Connection,
    source: &Path,
) -> StoreResult<(MergeReport, Vec<NaiveDate>)> {
    let src = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| StoreError::StorageUnavailable {
            path: source.display().to_string(),
            reason: e.to_string(),
        })?;

    // Only same-version stores merge cleanly; anything else would need its
    // own migration pass first.
    let src_version = current_version(&src);
    if src_version != LATEST_VERSION {
        return Err(StoreError::IncompatibleSchema {
            found: src_version,
            supported: LATEST_VERSION,
        });
    }

    let src_patients = patient::all_patients(&src)?;
    let src_visits = visit::all_visits(&src)?;

    let mut report = MergeReport::default();
    let mut affected_dates: Vec<NaiveDate> = Vec::new();
    // source patient id -> destination patient id
    let mut id_map: HashMap<Uuid, Uuid> = HashMap::new();

    let tx = dest.transaction()?;

    for sp in &src_patients {
        if let Some(existing) = patient::get_patient_by_reference(&tx, sp.reference_number)? {
            id_map.insert(sp.id, existing.id);
            report.patients_skipped += 1;
            continue;
        }
        patient::insert_patient(&tx, sp)?;
        id_map.insert(sp.id, sp.id);
        report.patients_added += 1;
    }

    // Adopted reference numbers must never be handed out again.
    patient::advance_ref_counter(&tx)?;

    for sv in &src_visits {
        let Some(&target_id) = id_map.get(&sv.patient_id) else {
            report.visits_skipped += 1;
            continue;
        };
        if visit::visit_exists_at(&tx, &target_id, sv.visit_date, sv.visit_time)? {
            report.visits_skipped += 1;
            continue;
        }

        let mut merged = sv.clone();
        merged.patient_id = target_id;
        // A visit keeps its identity unless the destination already has it.
        if visit::get_visit(&tx, &merged.id)?.is_some() {
            merged.id = Uuid::new_v4();
        }
        visit::insert_visit(&tx, &merged)?;
        affected_dates.push(merged.visit_date);
        report.visits_added += 1;
    }

    tx.commit()?;

    affected_dates.sort_unstable();
    affected_dates.dedup();

    tracing::info!(
        "merged {} patients and {} visits from {} ({} patients, {} visits skipped)",
        report.patients_added,
        report.visits_added,
        source.display(),
        report.patients_skipped,
        report.visits_skipped,
    );
    Ok((report, affected_dates))
}
