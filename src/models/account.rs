use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::Role;

/// An operator account. The password hash never leaves the storage layer;
/// verification happens through [`crate::store::ClinicStore::verify_credentials`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
    pub created_at: NaiveDateTime,
}
