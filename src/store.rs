//! The store facade — the sole path the interface layer uses to read and
//! write records.
//!
//! Composes the connection pool, repositories, search engine, and stats
//! cache into validated, transactional operations. Every mutation commits
//! atomically, then synchronously flags exactly the aggregates it can have
//! changed, so no reader observes a committed mutation next to a stale
//! aggregate. Operations acquire a pooled connection on entry and release
//! it on return; no handle outlives its operation.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use uuid::Uuid;

use crate::auth;
use crate::backup::{self, BackupReport, MergeReport};
use crate::config::StoreConfig;
use crate::db::pool::ConnectionPool;
use crate::db::repository::{account, patient, visit};
use crate::db::{sqlite, StoreError, StoreResult};
use crate::export;
use crate::models::account::Account;
use crate::models::enums::Role;
use crate::models::filters::{DateRange, Page, PatientFilter};
use crate::models::patient::{Patient, PatientInput};
use crate::models::visit::{Visit, VisitDetail, VisitInput, VisitSummary};
use crate::search::{self, CancelToken, PatientHit};
use crate::stats::{StatKey, StatsCache};

/// Handle to an open clinic store.
pub struct ClinicStore {
    pool: ConnectionPool,
    stats: StatsCache,
}

impl ClinicStore {
    /// Open the store and run pending schema migrations to completion.
    /// No other operation is reachable until this returns; a migration or
    /// open failure is fatal to the application.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let pool = ConnectionPool::open(&config)?;
        {
            let mut conn = pool.acquire()?;
            sqlite::run_migrations(&mut conn)?;
        }
        tracing::info!("store open at schema v{}", sqlite::LATEST_VERSION);
        Ok(Self {
            pool,
            stats: StatsCache::new(),
        })
    }

    /// Release every pooled connection deterministically. Blocks until
    /// outstanding handles have been returned.
    pub fn close(self) {
        self.pool.close();
    }

    // ── Patients ─────────────────────────────────────────

    /// Create a patient, assigning the next reference number inside the
    /// same transaction as the insert.
    pub fn create_patient(&self, input: &PatientInput) -> StoreResult<Patient> {
        input.validate()?;
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        let reference = patient::next_reference_number(&tx)?;
        let record = patient::patient_from_input(Uuid::new_v4(), reference, input, now());
        patient::insert_patient(&tx, &record)?;
        tx.commit()?;

        self.stats.invalidate(&[StatKey::TotalPatients]);
        Ok(record)
    }

    /// Update a patient's profile. The reference number is immutable and
    /// not part of the input. Profile edits affect no cached aggregate.
    pub fn update_patient(&self, id: &Uuid, input: &PatientInput) -> StoreResult<Patient> {
        input.validate()?;
        let conn = self.pool.acquire()?;
        if !patient::update_patient(&conn, id, input)? {
            return Err(not_found("patient", id));
        }
        patient::get_patient(&conn, id)?.ok_or_else(|| not_found("patient", id))
    }

    pub fn get_patient(&self, id: &Uuid) -> StoreResult<Option<Patient>> {
        let conn = self.pool.acquire()?;
        patient::get_patient(&conn, id)
    }

    pub fn get_patient_by_reference(&self, reference: i64) -> StoreResult<Option<Patient>> {
        let conn = self.pool.acquire()?;
        patient::get_patient_by_reference(&conn, reference)
    }

    /// Delete a patient. Their visits cascade away in the same transaction.
    pub fn delete_patient(&self, id: &Uuid) -> StoreResult<()> {
        let mut conn = self.pool.acquire()?;
        let affected = visit::visit_dates_for_patient(&conn, id)?;

        let tx = conn.transaction()?;
        if !patient::delete_patient(&tx, id)? {
            return Err(not_found("patient", id));
        }
        tx.commit()?;

        let mut keys = vec![StatKey::TotalPatients];
        if !affected.is_empty() {
            keys.push(StatKey::TotalVisits);
            keys.extend(affected.into_iter().map(StatKey::VisitsOn));
        }
        self.stats.invalidate(&keys);
        Ok(())
    }

    /// One alphabetical page of patients.
    pub fn list_patients(&self, page: usize, page_size: usize) -> StoreResult<Page<Patient>> {
        let conn = self.pool.acquire()?;
        let (items, total) = patient::list_page(&conn, page.max(1), page_size.max(1))?;
        Ok(Page {
            items,
            total,
            page: page.max(1),
            page_size: page_size.max(1),
        })
    }

    /// Move every visit from one patient record to another. Totals and day
    /// buckets only change owner, so nothing is invalidated.
    pub fn reassign_visits(&self, from: &Uuid, to: &Uuid) -> StoreResult<usize> {
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        ensure_patient(&tx, from)?;
        ensure_patient(&tx, to)?;
        let moved = patient::reassign_visits(&tx, from, to)?;
        tx.commit()?;
        Ok(moved)
    }

    /// Merge a duplicate registration into the surviving record: move the
    /// history across, then delete the duplicate. Returns visits moved.
    pub fn merge_patients(&self, source: &Uuid, target: &Uuid) -> StoreResult<usize> {
        if source == target {
            return Err(StoreError::Validation {
                field: "target",
                reason: "cannot merge a patient into itself".into(),
            });
        }

        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        ensure_patient(&tx, source)?;
        ensure_patient(&tx, target)?;
        let moved = patient::reassign_visits(&tx, source, target)?;
        patient::delete_patient(&tx, source)?;
        tx.commit()?;

        self.stats.invalidate(&[StatKey::TotalPatients]);
        Ok(moved)
    }

    // ── Visits ───────────────────────────────────────────

    pub fn create_visit(&self, input: &VisitInput) -> StoreResult<Visit> {
        input.validate()?;
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        if patient::get_patient(&tx, &input.patient_id)?.is_none() {
            return Err(StoreError::Validation {
                field: "patient_id",
                reason: "referenced patient does not exist".into(),
            });
        }
        let record = visit::visit_from_input(Uuid::new_v4(), input, now());
        visit::insert_visit(&tx, &record)?;
        tx.commit()?;

        self.stats.invalidate(&[
            StatKey::TotalVisits,
            StatKey::VisitsOn(record.visit_date),
        ]);
        Ok(record)
    }

    pub fn update_visit(&self, id: &Uuid, input: &VisitInput) -> StoreResult<Visit> {
        input.validate()?;
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        let old = visit::get_visit(&tx, id)?.ok_or_else(|| not_found("visit", id))?;
        if patient::get_patient(&tx, &input.patient_id)?.is_none() {
            return Err(StoreError::Validation {
                field: "patient_id",
                reason: "referenced patient does not exist".into(),
            });
        }
        visit::update_visit(&tx, id, input)?;
        tx.commit()?;

        // The total is unchanged; day buckets only move when the date does.
        if old.visit_date != input.visit_date {
            self.stats.invalidate(&[
                StatKey::VisitsOn(old.visit_date),
                StatKey::VisitsOn(input.visit_date),
            ]);
        }
        visit::get_visit(&conn, id)?.ok_or_else(|| not_found("visit", id))
    }

    pub fn get_visit(&self, id: &Uuid) -> StoreResult<Option<Visit>> {
        let conn = self.pool.acquire()?;
        visit::get_visit(&conn, id)
    }

    /// A visit joined with its patient's name and reference number.
    pub fn get_visit_detail(&self, id: &Uuid) -> StoreResult<Option<VisitDetail>> {
        let conn = self.pool.acquire()?;
        visit::get_visit_detail(&conn, id)
    }

    pub fn delete_visit(&self, id: &Uuid) -> StoreResult<()> {
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        let old = visit::get_visit(&tx, id)?.ok_or_else(|| not_found("visit", id))?;
        visit::delete_visit(&tx, id)?;
        tx.commit()?;

        self.stats
            .invalidate(&[StatKey::TotalVisits, StatKey::VisitsOn(old.visit_date)]);
        Ok(())
    }

    /// One page of a patient's history, newest first, optionally bounded by
    /// a date range.
    pub fn visits_for_patient(
        &self,
        patient_id: &Uuid,
        range: DateRange,
        page: usize,
        page_size: usize,
    ) -> StoreResult<Page<Visit>> {
        let conn = self.pool.acquire()?;
        let (items, total) =
            visit::visits_for_patient_page(&conn, patient_id, range, page.max(1), page_size.max(1))?;
        Ok(Page {
            items,
            total,
            page: page.max(1),
            page_size: page_size.max(1),
        })
    }

    /// The day sheet: every visit on one date, with patient names.
    pub fn visits_on(&self, date: NaiveDate) -> StoreResult<Vec<VisitDetail>> {
        let conn = self.pool.acquire()?;
        visit::visits_on(&conn, date)
    }

    /// One page over the whole visit log, newest first.
    pub fn list_visits(
        &self,
        range: DateRange,
        page: usize,
        page_size: usize,
    ) -> StoreResult<Page<VisitDetail>> {
        let conn = self.pool.acquire()?;
        let (items, total) = visit::list_page(&conn, range, page.max(1), page_size.max(1))?;
        Ok(Page {
            items,
            total,
            page: page.max(1),
            page_size: page_size.max(1),
        })
    }

    pub fn visit_summary(&self, patient_id: &Uuid) -> StoreResult<VisitSummary> {
        let conn = self.pool.acquire()?;
        visit::visit_summary(&conn, patient_id)
    }

    /// Date of the most recently entered paper-backfill visit, for resuming
    /// an encoding session.
    pub fn last_encoded_visit_date(&self) -> StoreResult<Option<NaiveDate>> {
        let conn = self.pool.acquire()?;
        visit::last_encoded_visit_date(&conn)
    }

    // ── Accounts ─────────────────────────────────────────

    /// First-run check: has any operator account been created yet?
    pub fn any_account_exists(&self) -> StoreResult<bool> {
        let conn = self.pool.acquire()?;
        account::any_exists(&conn)
    }

    pub fn create_account(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> StoreResult<Account> {
        let username = validate_username(username)?;
        validate_password(password)?;

        let record = Account {
            id: Uuid::new_v4(),
            username,
            role,
            created_at: now(),
        };
        let hash = auth::hash_password(password);
        let conn = self.pool.acquire()?;
        account::insert_account(&conn, &record, &hash)?;
        Ok(record)
    }

    /// Check a username/password pair. An unknown username and a wrong
    /// password both come back as a plain `false`.
    pub fn verify_credentials(&self, username: &str, password: &str) -> StoreResult<bool> {
        let conn = self.pool.acquire()?;
        match account::get_password_hash(&conn, username)? {
            Some(hash) => Ok(auth::verify_password(password, &hash)),
            None => Ok(false),
        }
    }

    pub fn get_account(&self, username: &str) -> StoreResult<Option<Account>> {
        let conn = self.pool.acquire()?;
        account::get_account(&conn, username)
    }

    pub fn rename_account(&self, username: &str, new_username: &str) -> StoreResult<()> {
        let new_username = validate_username(new_username)?;
        let conn = self.pool.acquire()?;
        if !account::rename_account(&conn, username, &new_username)? {
            return Err(StoreError::NotFound {
                entity: "account",
                id: username.to_string(),
            });
        }
        Ok(())
    }

    pub fn change_password(&self, username: &str, new_password: &str) -> StoreResult<()> {
        validate_password(new_password)?;
        let hash = auth::hash_password(new_password);
        let conn = self.pool.acquire()?;
        if !account::set_password_hash(&conn, username, &hash)? {
            return Err(StoreError::NotFound {
                entity: "account",
                id: username.to_string(),
            });
        }
        Ok(())
    }

    // ── Aggregates ───────────────────────────────────────

    /// Read a cached aggregate, recomputing it first if a mutation flagged
    /// it stale.
    pub fn stat(&self, key: StatKey) -> StoreResult<i64> {
        let conn = self.pool.acquire()?;
        self.stats.get(&conn, key)
    }

    #[cfg(test)]
    pub(crate) fn stat_recompute_count(&self, key: StatKey) -> u64 {
        self.stats.recompute_count(key)
    }

    // ── Search & export ──────────────────────────────────

    pub fn search_patients(
        &self,
        filter: &PatientFilter,
        cancel: &CancelToken,
    ) -> StoreResult<Page<PatientHit>> {
        let conn = self.pool.acquire()?;
        search::search_patients(&conn, filter, cancel)
    }

    /// Stream the patients matching `filter` to a CSV file with a stable
    /// column order. Returns rows written.
    pub fn export_patients_csv(
        &self,
        filter: &PatientFilter,
        dest: &Path,
        cancel: &CancelToken,
    ) -> StoreResult<u64> {
        let conn = self.pool.acquire()?;
        export::export_patients_csv(&conn, filter, dest, cancel)
    }

    /// Stream the full visit log, joined with patient details, to a CSV file.
    pub fn export_visits_csv(&self, dest: &Path, cancel: &CancelToken) -> StoreResult<u64> {
        let conn = self.pool.acquire()?;
        export::export_visits_csv(&conn, dest, cancel)
    }

    // ── Maintenance ──────────────────────────────────────

    /// Consistent point-in-time copy of the store to `dest`.
    pub fn backup_to(&self, dest: &Path) -> StoreResult<BackupReport> {
        let conn = self.pool.acquire()?;
        backup::backup_to(&conn, dest)
    }

    /// Import patients and visits from another clinic's store file.
    pub fn merge_from(&self, source: &Path) -> StoreResult<MergeReport> {
        let mut conn = self.pool.acquire()?;
        let (report, dates) = backup::merge_from(&mut conn, source)?;

        let mut keys = Vec::new();
        if report.patients_added > 0 {
            keys.push(StatKey::TotalPatients);
        }
        if report.visits_added > 0 {
            keys.push(StatKey::TotalVisits);
            keys.extend(dates.into_iter().map(StatKey::VisitsOn));
        }
        self.stats.invalidate(&keys);
        Ok(report)
    }
}

fn ensure_patient(conn: &rusqlite::Connection, id: &Uuid) -> StoreResult<()> {
    if patient::get_patient(conn, id)?.is_none() {
        return Err(not_found("patient", id));
    }
    Ok(())
}

fn not_found(entity: &'static str, id: &Uuid) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn validate_username(username: &str) -> StoreResult<String> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation {
            field: "username",
            reason: "must not be empty".into(),
        });
    }
    Ok(trimmed.to_string())
}

fn validate_password(password: &str) -> StoreResult<()> {
    if password.len() < 8 {
        return Err(StoreError::Validation {
            field: "password",
            reason: "must be at least 8 characters".into(),
        });
    }
    Ok(())
}

/// Wall-clock now, truncated to whole seconds to match the stored format.
fn now() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::{Sex, VisitType};
    use crate::models::filters::AgeRange;
    use crate::models::filters::SortKey;
    use rusqlite::Connection;

    fn memory_store() -> ClinicStore {
        ClinicStore::open(StoreConfig::in_memory()).unwrap()
    }

    fn maria_input() -> PatientInput {
        PatientInput {
            last_name: "Santos".into(),
            first_name: "Maria".into(),
            date_of_birth: "1990-05-10".parse().ok(),
            sex: Some(Sex::Female),
            ..Default::default()
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn maria_santos_scenario() {
        let store = memory_store();

        let maria = store.create_patient(&maria_input()).unwrap();
        assert_eq!(maria.reference_display(), "00-00-01");
        assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), 1);

        let mut visit_input = VisitInput::new(maria.id, date("2024-01-15"));
        visit_input.weight_kg = Some(60.0);
        store.create_visit(&visit_input).unwrap();

        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 1);
        // totalPatients was unaffected by the visit: same value, no recompute.
        assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), 1);
        assert_eq!(store.stat_recompute_count(StatKey::TotalPatients), 1);

        let mut filter = PatientFilter::new();
        filter.reference_date = Some(date("2024-06-01"));
        filter.age = Some(AgeRange { min: 30, max: 40 });
        filter.sex = Some(Sex::Female);
        let hits = store.search_patients(&filter, &CancelToken::new()).unwrap();
        assert_eq!(hits.total, 1);
        assert_eq!(hits.items[0].patient.full_name(), "Santos, Maria");

        filter.age = Some(AgeRange { min: 0, max: 10 });
        let hits = store.search_patients(&filter, &CancelToken::new()).unwrap();
        assert_eq!(hits.total, 0);
    }

    #[test]
    fn stats_are_never_stale_after_mutations() {
        let store = memory_store();
        for i in 1..=5i64 {
            let mut input = maria_input();
            input.first_name = format!("Maria{i}");
            store.create_patient(&input).unwrap();
            assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), i);
        }
    }

    #[test]
    fn reference_numbers_unique_and_increasing_through_facade() {
        let store = memory_store();
        let mut previous = 0;
        for i in 0..10 {
            let mut input = maria_input();
            input.first_name = format!("P{i}");
            let p = store.create_patient(&input).unwrap();
            assert!(p.reference_number > previous);
            previous = p.reference_number;
        }
        let first = store.list_patients(1, 1).unwrap().items[0].id;
        store.delete_patient(&first).unwrap();
        let p = store.create_patient(&maria_input()).unwrap();
        assert!(p.reference_number > previous);
    }

    #[test]
    fn visit_mutations_touch_only_their_day_buckets() {
        let store = memory_store();
        let maria = store.create_patient(&maria_input()).unwrap();
        let jan15 = date("2024-01-15");
        let jan16 = date("2024-01-16");

        let v1 = store
            .create_visit(&VisitInput::new(maria.id, jan15))
            .unwrap();
        store
            .create_visit(&VisitInput::new(maria.id, jan15))
            .unwrap();
        assert_eq!(store.stat(StatKey::VisitsOn(jan15)).unwrap(), 2);
        assert_eq!(store.stat(StatKey::VisitsOn(jan16)).unwrap(), 0);
        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 2);

        // Move one visit to the next day: both buckets refresh, total doesn't
        // recompute.
        store
            .update_visit(&v1.id, &VisitInput::new(maria.id, jan16))
            .unwrap();
        assert_eq!(store.stat(StatKey::VisitsOn(jan15)).unwrap(), 1);
        assert_eq!(store.stat(StatKey::VisitsOn(jan16)).unwrap(), 1);
        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 2);
        assert_eq!(store.stat_recompute_count(StatKey::TotalVisits), 1);

        store.delete_visit(&v1.id).unwrap();
        assert_eq!(store.stat(StatKey::VisitsOn(jan16)).unwrap(), 0);
        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 1);
    }

    #[test]
    fn deleting_patient_cascades_to_visits() {
        let store = memory_store();
        let maria = store.create_patient(&maria_input()).unwrap();
        let jan15 = date("2024-01-15");
        let visit = store
            .create_visit(&VisitInput::new(maria.id, jan15))
            .unwrap();

        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 1);
        store.delete_patient(&maria.id).unwrap();

        assert!(store.get_patient(&maria.id).unwrap().is_none());
        assert!(store.get_visit(&visit.id).unwrap().is_none());
        assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), 0);
        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 0);
        assert_eq!(store.stat(StatKey::VisitsOn(jan15)).unwrap(), 0);
    }

    #[test]
    fn validation_failures_write_nothing() {
        let store = memory_store();

        let mut input = maria_input();
        input.first_name = "".into();
        assert!(matches!(
            store.create_patient(&input).unwrap_err(),
            StoreError::Validation { field: "first_name", .. }
        ));

        let orphan = VisitInput::new(Uuid::new_v4(), date("2024-01-15"));
        assert!(matches!(
            store.create_visit(&orphan).unwrap_err(),
            StoreError::Validation { field: "patient_id", .. }
        ));

        assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), 0);
        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 0);
    }

    #[test]
    fn merge_patients_moves_history_and_deletes_duplicate() {
        let store = memory_store();
        let keep = store.create_patient(&maria_input()).unwrap();
        let mut dup_input = maria_input();
        dup_input.middle_name = Some("C.".into());
        let dup = store.create_patient(&dup_input).unwrap();
        store
            .create_visit(&VisitInput::new(dup.id, date("2024-01-15")))
            .unwrap();

        let moved = store.merge_patients(&dup.id, &keep.id).unwrap();
        assert_eq!(moved, 1);
        assert!(store.get_patient(&dup.id).unwrap().is_none());
        assert_eq!(store.visit_summary(&keep.id).unwrap().total_visits, 1);
        assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), 1);
        assert_eq!(store.stat(StatKey::TotalVisits).unwrap(), 1);

        let err = store.merge_patients(&keep.id, &keep.id).unwrap_err();
        assert!(matches!(err, StoreError::Validation { field: "target", .. }));
    }

    #[test]
    fn first_run_account_flow() {
        let store = memory_store();
        assert!(!store.any_account_exists().unwrap());

        let account = store
            .create_account("clinic-admin", "correct horse battery", Role::Admin)
            .unwrap();
        assert_eq!(account.role, Role::Admin);
        assert!(store.any_account_exists().unwrap());

        assert!(store
            .verify_credentials("clinic-admin", "correct horse battery")
            .unwrap());
        assert!(!store
            .verify_credentials("clinic-admin", "wrong password")
            .unwrap());
        assert!(!store.verify_credentials("ghost", "anything").unwrap());

        let err = store
            .create_account("clinic-admin", "another password", Role::Staff)
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        let err = store
            .create_account("aide", "short", Role::Staff)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation { field: "password", .. }
        ));

        store.rename_account("clinic-admin", "head-admin").unwrap();
        store
            .change_password("head-admin", "a brand new passphrase")
            .unwrap();
        assert!(store
            .verify_credentials("head-admin", "a brand new passphrase")
            .unwrap());
    }

    #[test]
    fn committed_state_survives_reopen_uncommitted_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clinic.db");

        let store = ClinicStore::open(StoreConfig::at(&path)).unwrap();
        let maria = store.create_patient(&maria_input()).unwrap();
        store.close();

        // Simulate a crash mid-write: an insert in a never-committed
        // transaction on a separate connection that just goes away.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "BEGIN;
                 INSERT INTO patients (id, reference_number, last_name, first_name)
                 VALUES ('torn-write', 99, 'Lost', 'Record');",
            )
            .unwrap();
            // Dropped without COMMIT: rolled back on close.
        }

        let store = ClinicStore::open(StoreConfig::at(&path)).unwrap();
        assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), 1);
        let survived = store
            .get_patient_by_reference(maria.reference_number)
            .unwrap()
            .unwrap();
        assert_eq!(survived.first_name, "Maria");
        store.close();
    }

    #[test]
    fn backup_restores_into_working_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClinicStore::open(StoreConfig::at(dir.path().join("live.db"))).unwrap();
        let maria = store.create_patient(&maria_input()).unwrap();
        store
            .create_visit(&VisitInput::new(maria.id, date("2024-01-15")))
            .unwrap();

        let backup_path = dir.path().join("backup.db");
        let report = store.backup_to(&backup_path).unwrap();
        assert!(report.size_bytes > 0);
        store.close();

        let restored = ClinicStore::open(StoreConfig::at(&backup_path)).unwrap();
        assert_eq!(restored.stat(StatKey::TotalPatients).unwrap(), 1);
        assert_eq!(restored.stat(StatKey::TotalVisits).unwrap(), 1);
        restored.close();
    }

    #[test]
    fn merge_from_refreshes_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let dest = ClinicStore::open(StoreConfig::at(dir.path().join("dest.db"))).unwrap();
        assert_eq!(dest.stat(StatKey::TotalPatients).unwrap(), 0);

        let src_path = dir.path().join("src.db");
        let src = ClinicStore::open(StoreConfig::at(&src_path)).unwrap();
        let p = src.create_patient(&maria_input()).unwrap();
        src.create_visit(&VisitInput::new(p.id, date("2024-01-15")))
            .unwrap();
        src.close();

        let report = dest.merge_from(&src_path).unwrap();
        assert_eq!(report.patients_added, 1);
        assert_eq!(report.visits_added, 1);
        assert_eq!(dest.stat(StatKey::TotalPatients).unwrap(), 1);
        assert_eq!(dest.stat(StatKey::TotalVisits).unwrap(), 1);
        dest.close();
    }

    #[test]
    fn patient_csv_round_trips_exported_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();

        let mut input = maria_input();
        input.middle_name = Some("Cruz, the \"Third\"".into());
        input.address = Some("12 Mabini St, Quezon City".into());
        let maria = store.create_patient(&input).unwrap();
        store
            .create_visit(&VisitInput::new(maria.id, date("2024-01-15")))
            .unwrap();

        let mut filter = PatientFilter::new();
        filter.reference_date = Some(date("2024-06-01"));
        filter.sort = SortKey::Name;

        let dest = dir.path().join("patients.csv");
        let rows = store
            .export_patients_csv(&filter, &dest, &CancelToken::new())
            .unwrap();
        assert_eq!(rows, 1);

        let text = std::fs::read_to_string(&dest).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), crate::export::PATIENT_CSV_HEADER);
        let row = lines.next().unwrap();
        assert!(row.starts_with(&format!("{},Santos,Maria", maria.reference_number)));
        assert!(row.contains("\"Cruz, the \"\"Third\"\"\""));
        assert!(row.contains("\"12 Mabini St, Quezon City\""));
        assert!(row.contains("1990-05-10"));
        assert!(row.contains("2024-01-15"));
    }

    #[test]
    fn cancelled_export_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        store.create_patient(&maria_input()).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let dest = dir.path().join("patients.csv");
        let err = store
            .export_patients_csv(&PatientFilter::new(), &dest, &token)
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(!dest.exists());

        // A cancelled read also never clears a dirty flag: the next stat
        // read still reflects the store.
        assert_eq!(store.stat(StatKey::TotalPatients).unwrap(), 1);
    }

    #[test]
    fn visit_csv_exports_full_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        let maria = store.create_patient(&maria_input()).unwrap();

        let mut encode = VisitInput::new(maria.id, date("2019-06-01"));
        encode.visit_type = VisitType::Encode;
        store.create_visit(&encode).unwrap();
        let mut walkin = VisitInput::new(maria.id, date("2024-01-15"));
        walkin.weight_kg = Some(60.0);
        walkin.blood_pressure = Some("120/80".into());
        store.create_visit(&walkin).unwrap();

        let dest = dir.path().join("visits.csv");
        let rows = store.export_visits_csv(&dest, &CancelToken::new()).unwrap();
        assert_eq!(rows, 2);

        let text = std::fs::read_to_string(&dest).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], crate::export::VISIT_CSV_HEADER);
        // Newest first.
        assert!(lines[1].contains("2024-01-15"));
        assert!(lines[1].contains("120/80"));
        assert!(lines[2].contains("2019-06-01"));
        assert!(lines[2].contains("encode"));
    }

    #[test]
    fn day_sheet_through_facade() {
        let store = memory_store();
        let maria = store.create_patient(&maria_input()).unwrap();
        let visit = store
            .create_visit(&VisitInput::new(maria.id, date("2024-01-15")))
            .unwrap();

        let sheet = store.visits_on(date("2024-01-15")).unwrap();
        assert_eq!(sheet.len(), 1);
        assert_eq!(sheet[0].patient_name, "Santos, Maria");
        assert_eq!(sheet[0].reference_number, maria.reference_number);
        assert!(store.visits_on(date("2024-01-16")).unwrap().is_empty());

        let detail = store.get_visit_detail(&visit.id).unwrap().unwrap();
        assert_eq!(detail.patient_name, "Santos, Maria");
        assert_eq!(detail.visit.id, visit.id);
    }
}
