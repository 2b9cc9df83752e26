pub mod account;
pub mod enums;
pub mod filters;
pub mod patient;
pub mod visit;

pub use account::Account;
pub use enums::{CivilStatus, Role, Sex, VisitType};
pub use filters::{AgeRange, DateRange, Page, PatientFilter, SortKey};
pub use patient::{Patient, PatientInput};
pub use visit::{Visit, VisitDetail, VisitInput, VisitSummary};
