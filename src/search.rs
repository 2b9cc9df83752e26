//! Index-aware patient search.
//!
//! Translates a [`PatientFilter`] into a single SQL statement whose driving
//! predicate is the most selective one supplied (exact reference number >
//! name prefix > birth-date range > visit-date range > full scan); the
//! remaining predicates apply as residual filters over the narrowed set.
//! Results come back one bounded page at a time with a total count — the
//! unfiltered table is never materialized in memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::db::repository::parse_date;
use crate::db::repository::patient::{map_patient_row, patient_from_row, PATIENT_COLS};
use crate::db::{StoreError, StoreResult};
use crate::models::filters::{AgeRange, Page, PatientFilter, SortKey};
use crate::models::patient::Patient;

/// Cooperative cancellation for long scans and exports. Cloned freely; all
/// clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> StoreResult<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Which index drives the scan for a given filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPlan {
    ByReference,
    ByNamePrefix,
    ByBirthDateRange,
    ByVisitDate,
    FullScan,
}

/// Pick the most selective supplied predicate.
pub fn plan_for(filter: &PatientFilter) -> QueryPlan {
    if filter.reference.is_some() {
        QueryPlan::ByReference
    } else if filter
        .name_prefix
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty())
    {
        QueryPlan::ByNamePrefix
    } else if filter.age.is_some() {
        QueryPlan::ByBirthDateRange
    } else if filter
        .visited_between
        .is_some_and(|r| r.from.is_some() || r.to.is_some())
    {
        QueryPlan::ByVisitDate
    } else {
        QueryPlan::FullScan
    }
}

/// One search result row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientHit {
    pub patient: Patient,
    pub last_visit: Option<NaiveDate>,
    /// Completed years on the filter's reference date.
    pub age: Option<u32>,
}

const JOIN: &str = "FROM patients p \
     LEFT JOIN (SELECT patient_id, MAX(visit_date) AS last_visit \
                FROM visit_logs GROUP BY patient_id) v \
     ON v.patient_id = p.id";

pub fn search_patients(
    conn: &Connection,
    filter: &PatientFilter,
    cancel: &CancelToken,
) -> StoreResult<Page<PatientHit>> {
    cancel.check()?;
    tracing::debug!("patient search plan: {:?}", plan_for(filter));

    let reference_date = filter
        .reference_date
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let (where_clause, args) = build_where(filter, reference_date);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {JOIN} {where_clause}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    cancel.check()?;

    let page = filter.page.max(1);
    let page_size = if filter.page_size == 0 {
        25
    } else {
        filter.page_size
    };
    let offset = (page - 1) * page_size;

    let sql = format!(
        "SELECT {cols}, v.last_visit {JOIN} {where_clause} {order} LIMIT {page_size} OFFSET {offset}",
        cols = qualified_patient_cols(),
        order = order_clause(filter.sort),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok((map_patient_row(row)?, row.get::<_, Option<String>>(17)?))
    })?;

    let mut items = Vec::new();
    for row in rows {
        cancel.check()?;
        let (patient_row, last_visit) = row?;
        let patient = patient_from_row(patient_row)?;
        let age = patient.age_on(reference_date);
        items.push(PatientHit {
            patient,
            last_visit: last_visit.as_deref().and_then(parse_date),
            age,
        });
    }

    Ok(Page {
        items,
        total,
        page,
        page_size,
    })
}

/// Visit every matching row without pagination, in the filter's sort order.
/// CSV export streams through this.
pub(crate) fn for_each_hit(
    conn: &Connection,
    filter: &PatientFilter,
    cancel: &CancelToken,
    mut f: impl FnMut(PatientHit) -> StoreResult<()>,
) -> StoreResult<u64> {
    cancel.check()?;

    let reference_date = filter
        .reference_date
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let (where_clause, args) = build_where(filter, reference_date);

    let sql = format!(
        "SELECT {cols}, v.last_visit {JOIN} {where_clause} {order}",
        cols = qualified_patient_cols(),
        order = order_clause(filter.sort),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok((map_patient_row(row)?, row.get::<_, Option<String>>(17)?))
    })?;

    let mut count = 0u64;
    for row in rows {
        cancel.check()?;
        let (patient_row, last_visit) = row?;
        let patient = patient_from_row(patient_row)?;
        let age = patient.age_on(reference_date);
        f(PatientHit {
            patient,
            last_visit: last_visit.as_deref().and_then(parse_date),
            age,
        })?;
        count += 1;
    }
    Ok(count)
}

fn qualified_patient_cols() -> String {
    PATIENT_COLS
        .split(", ")
        .map(|col| format!("p.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Assemble the WHERE clause, driving predicate first (mirroring
/// [`plan_for`]), residual predicates after.
fn build_where(filter: &PatientFilter, reference_date: NaiveDate) -> (String, Vec<Value>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    if let Some(reference) = filter.reference {
        conditions.push("p.reference_number = ?".into());
        args.push(Value::Integer(reference));
    }

    if let Some(prefix) = filter.name_prefix.as_deref() {
        let prefix = prefix.trim();
        if !prefix.is_empty() {
            conditions.push("p.last_name LIKE ?".into());
            args.push(Value::Text(format!("{prefix}%")));
        }
    }

    if let Some(age) = filter.age {
        let (oldest, youngest) = dob_bounds(age, reference_date);
        conditions.push("p.date_of_birth >= ?".into());
        args.push(Value::Text(oldest.to_string()));
        conditions.push("p.date_of_birth <= ?".into());
        args.push(Value::Text(youngest.to_string()));
    }

    if let Some(range) = filter.visited_between {
        if let Some(from) = range.from {
            conditions.push("v.last_visit >= ?".into());
            args.push(Value::Text(from.to_string()));
        }
        if let Some(to) = range.to {
            conditions.push("v.last_visit <= ?".into());
            args.push(Value::Text(to.to_string()));
        }
    }

    if let Some(query) = filter.query.as_deref() {
        let query = query.trim();
        if !query.is_empty() {
            // Reference numbers are stored undecorated, so strip the display
            // format (dashes, leading zeros) before matching digits.
            let cleaned = query.replace('-', "");
            let reference_digits = cleaned.trim_start_matches('0');
            if cleaned.chars().all(|c| c.is_ascii_digit()) && !reference_digits.is_empty() {
                conditions.push(
                    "(p.first_name LIKE ? OR p.middle_name LIKE ? OR p.last_name LIKE ? \
                     OR CAST(p.reference_number AS TEXT) LIKE ?)"
                        .into(),
                );
                args.push(Value::Text(format!("%{query}%")));
                args.push(Value::Text(format!("%{query}%")));
                args.push(Value::Text(format!("%{query}%")));
                args.push(Value::Text(format!("%{reference_digits}%")));
            } else {
                conditions.push(
                    "(p.first_name LIKE ? OR p.middle_name LIKE ? OR p.last_name LIKE ?)".into(),
                );
                args.push(Value::Text(format!("%{query}%")));
                args.push(Value::Text(format!("%{query}%")));
                args.push(Value::Text(format!("%{query}%")));
            }
        }
    }

    if let Some(sex) = filter.sex {
        conditions.push("p.sex = ?".into());
        args.push(Value::Text(sex.as_str().into()));
    }

    if let Some(status) = filter.civil_status {
        conditions.push("p.civil_status = ?".into());
        args.push(Value::Text(status.as_str().into()));
    }

    if let Some(range) = filter.registered_between {
        if let Some(from) = range.from {
            conditions.push("p.registered_at >= ?".into());
            args.push(Value::Text(format!("{from} 00:00:00")));
        }
        if let Some(to) = range.to {
            conditions.push("p.registered_at <= ?".into());
            args.push(Value::Text(format!("{to} 23:59:59")));
        }
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (clause, args)
}

fn order_clause(sort: SortKey) -> &'static str {
    match sort {
        SortKey::Name => "ORDER BY p.last_name, p.first_name",
        SortKey::Age => "ORDER BY p.date_of_birth IS NULL, p.date_of_birth, p.last_name",
        SortKey::RecentVisit => {
            "ORDER BY v.last_visit IS NULL, v.last_visit DESC, p.last_name"
        }
    }
}

/// Inclusive date-of-birth bounds for an age bracket on a reference date:
/// `(oldest admissible DOB, youngest admissible DOB)`.
fn dob_bounds(age: AgeRange, on: NaiveDate) -> (NaiveDate, NaiveDate) {
    let youngest = years_before(on, age.min);
    let oldest = years_before(on, age.max.saturating_add(1))
        .succ_opt()
        .unwrap_or(NaiveDate::MAX);
    (oldest, youngest)
}

/// The calendar date `years` years before `on`. Feb 29 collapses to Feb 28
/// in non-leap years.
fn years_before(on: NaiveDate, years: u32) -> NaiveDate {
    let year = on.year() - years as i32;
    NaiveDate::from_ymd_opt(year, on.month(), on.day())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, 2, 28).expect("Feb 28 exists"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityMode;
    use crate::db::repository::patient::{
        insert_patient, next_reference_number, patient_from_input,
    };
    use crate::db::repository::visit::{insert_visit, visit_from_input};
    use crate::db::sqlite::{configure_pragmas, run_migrations};
    use crate::models::enums::Sex;
    use crate::models::filters::DateRange;
    use crate::models::patient::PatientInput;
    use crate::models::visit::VisitInput;
    use uuid::Uuid;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        configure_pragmas(&conn, DurabilityMode::Full).unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    fn add_patient(conn: &Connection, last: &str, first: &str, dob: &str, sex: Sex) -> Patient {
        let reference = next_reference_number(conn).unwrap();
        let input = PatientInput {
            last_name: last.into(),
            first_name: first.into(),
            date_of_birth: Some(dob.parse().unwrap()),
            sex: Some(sex),
            ..Default::default()
        };
        let patient = patient_from_input(
            Uuid::new_v4(),
            reference,
            &input,
            chrono::Local::now().naive_local(),
        );
        insert_patient(conn, &patient).unwrap();
        patient
    }

    fn add_visit(conn: &Connection, patient_id: Uuid, date: &str) {
        let input = VisitInput::new(patient_id, date.parse().unwrap());
        insert_visit(
            conn,
            &visit_from_input(Uuid::new_v4(), &input, chrono::Local::now().naive_local()),
        )
        .unwrap();
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn filter() -> PatientFilter {
        PatientFilter {
            reference_date: Some(date("2024-06-01")),
            ..PatientFilter::new()
        }
    }

    #[test]
    fn plan_prefers_most_selective_predicate() {
        let mut f = filter();
        assert_eq!(plan_for(&f), QueryPlan::FullScan);

        f.visited_between = Some(DateRange {
            from: Some(date("2024-01-01")),
            to: None,
        });
        assert_eq!(plan_for(&f), QueryPlan::ByVisitDate);

        f.age = Some(AgeRange { min: 30, max: 40 });
        assert_eq!(plan_for(&f), QueryPlan::ByBirthDateRange);

        f.name_prefix = Some("S".into());
        assert_eq!(plan_for(&f), QueryPlan::ByNamePrefix);

        f.reference = Some(1);
        assert_eq!(plan_for(&f), QueryPlan::ByReference);
    }

    #[test]
    fn reference_lookup_matches_exactly_one() {
        let conn = test_conn();
        let maria = add_patient(&conn, "Santos", "Maria", "1990-05-10", Sex::Female);
        add_patient(&conn, "Reyes", "Ana", "1985-02-20", Sex::Female);

        let mut f = filter();
        f.reference = Some(maria.reference_number);
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].patient.id, maria.id);
    }

    #[test]
    fn age_bracket_with_sex_residual() {
        let conn = test_conn();
        add_patient(&conn, "Santos", "Maria", "1990-05-10", Sex::Female); // 34
        add_patient(&conn, "Cruz", "Ben", "1990-01-01", Sex::Male); // 34
        add_patient(&conn, "Reyes", "Ana", "2018-03-03", Sex::Female); // 6

        let mut f = filter();
        f.age = Some(AgeRange { min: 30, max: 40 });
        f.sex = Some(Sex::Female);
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].patient.first_name, "Maria");
        assert_eq!(page.items[0].age, Some(34));

        f.age = Some(AgeRange { min: 0, max: 10 });
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].patient.first_name, "Ana");
    }

    #[test]
    fn age_bounds_are_birthday_exact() {
        let conn = test_conn();
        // Turns 30 exactly on the reference date: included at min 30.
        add_patient(&conn, "OnBoundary", "Eve", "1994-06-01", Sex::Female);
        // One day short of 30: excluded at min 30, included at max 29.
        add_patient(&conn, "Under", "Lia", "1994-06-02", Sex::Female);

        let mut f = filter();
        f.age = Some(AgeRange { min: 30, max: 99 });
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].patient.last_name, "OnBoundary");

        f.age = Some(AgeRange { min: 0, max: 29 });
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].patient.last_name, "Under");
    }

    #[test]
    fn dob_bounds_deterministic_over_leap_day() {
        let bounds = dob_bounds(AgeRange { min: 1, max: 2 }, date("2023-02-28"));
        // Ages 1..=2 on 2023-02-28: born 2020-02-29 (leap day, still age 2)
        // through 2022-02-28 (turned 1 today).
        assert_eq!(bounds.0, date("2020-02-29"));
        assert_eq!(bounds.1, date("2022-02-28"));

        // Leap-day reference date collapses to Feb 28 in non-leap years.
        let bounds = dob_bounds(AgeRange { min: 1, max: 1 }, date("2024-02-29"));
        assert_eq!(bounds.1, date("2023-02-28"));
    }

    #[test]
    fn free_text_query_matches_names_and_reference_digits() {
        let conn = test_conn();
        let maria = add_patient(&conn, "Santos", "Maria", "1990-05-10", Sex::Female);
        add_patient(&conn, "Reyes", "Ana", "1985-02-20", Sex::Female);

        let mut f = filter();
        f.query = Some("anto".into());
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].patient.last_name, "Santos");

        // Reference search tolerates the display dashes.
        f.query = Some(maria.reference_display());
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert!(page.items.iter().any(|h| h.patient.id == maria.id));
    }

    #[test]
    fn recent_visit_sort_puts_latest_first() {
        let conn = test_conn();
        let maria = add_patient(&conn, "Santos", "Maria", "1990-05-10", Sex::Female);
        let ana = add_patient(&conn, "Reyes", "Ana", "1985-02-20", Sex::Female);
        let ben = add_patient(&conn, "Cruz", "Ben", "1980-01-01", Sex::Male);
        add_visit(&conn, maria.id, "2024-01-10");
        add_visit(&conn, ana.id, "2024-03-05");

        let mut f = filter();
        f.sort = SortKey::RecentVisit;
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].patient.id, ana.id);
        assert_eq!(page.items[1].patient.id, maria.id);
        assert_eq!(page.items[1].last_visit, Some(date("2024-01-10")));
        // Never visited sorts last.
        assert_eq!(page.items[2].patient.id, ben.id);
    }

    #[test]
    fn visit_date_range_filters_on_last_visit() {
        let conn = test_conn();
        let maria = add_patient(&conn, "Santos", "Maria", "1990-05-10", Sex::Female);
        let ana = add_patient(&conn, "Reyes", "Ana", "1985-02-20", Sex::Female);
        add_visit(&conn, maria.id, "2024-01-10");
        add_visit(&conn, ana.id, "2023-06-01");

        let mut f = filter();
        f.visited_between = Some(DateRange {
            from: Some(date("2024-01-01")),
            to: None,
        });
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].patient.id, maria.id);
    }

    #[test]
    fn pagination_bounds_results_but_reports_full_total() {
        let conn = test_conn();
        for i in 0..7 {
            add_patient(&conn, &format!("Name{i:02}"), "Pat", "1990-01-01", Sex::Male);
        }

        let mut f = filter();
        f.page_size = 3;
        f.page = 3;
        let page = search_patients(&conn, &f, &CancelToken::new()).unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.page_count(), 3);
    }

    #[test]
    fn cancelled_token_aborts_before_scanning() {
        let conn = test_conn();
        add_patient(&conn, "Santos", "Maria", "1990-05-10", Sex::Female);

        let token = CancelToken::new();
        token.cancel();
        let err = search_patients(&conn, &filter(), &token).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}
