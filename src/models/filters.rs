use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::enums::{CivilStatus, Sex};

/// Inclusive calendar-date range; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Inclusive age bracket in completed years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: u32,
    pub max: u32,
}

/// Result ordering for patient searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Name,
    Age,
    RecentVisit,
}

/// Filter specification for patient search and CSV export.
///
/// Every predicate is optional; the engine picks the most selective one to
/// drive an index scan and applies the rest as residual filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientFilter {
    /// Free text matched against first/middle/last name substrings and the
    /// reference number (dashes ignored).
    pub query: Option<String>,
    /// Last-name prefix (alphabetical browsing, e.g. a single initial).
    pub name_prefix: Option<String>,
    /// Exact reference number.
    pub reference: Option<i64>,
    /// Age bracket, evaluated against `reference_date`.
    pub age: Option<AgeRange>,
    /// The "now" used for age computation. Must be set when `age` is; kept
    /// explicit so results do not depend on the evaluating machine's clock.
    pub reference_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub civil_status: Option<CivilStatus>,
    /// Patients whose most recent visit falls in this range.
    pub visited_between: Option<DateRange>,
    /// Registration-date range.
    pub registered_between: Option<DateRange>,
    pub sort: SortKey,
    /// 1-indexed page number.
    pub page: usize,
    pub page_size: usize,
}

impl PatientFilter {
    pub fn new() -> Self {
        Self {
            page: 1,
            page_size: 25,
            ..Default::default()
        }
    }
}

/// One bounded page of results plus the total match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    pub fn page_count(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        ((self.total.max(0) as usize) + self.page_size - 1) / self.page_size
    }
}
