//! Account table operations. Password hashes stay inside this module and
//! the store facade's verification path; they are never attached to the
//! `Account` model handed to callers.

use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, parse_uuid};
use crate::db::{map_constraint, StoreResult};
use crate::models::account::Account;
use crate::models::enums::Role;

pub fn insert_account(
    conn: &Connection,
    account: &Account,
    password_hash: &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO accounts (id, username, password_hash, role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            account.id.to_string(),
            account.username,
            password_hash,
            account.role.as_str(),
            fmt_datetime(account.created_at),
        ],
    )
    .map_err(|e| map_constraint(e, "username already taken"))?;
    Ok(())
}

pub fn get_account(conn: &Connection, username: &str) -> StoreResult<Option<Account>> {
    conn.query_row(
        "SELECT id, username, role, created_at FROM accounts WHERE username = ?1",
        params![username],
        map_account_row,
    )
    .optional()?
    .map(account_from_row)
    .transpose()
}

pub fn get_password_hash(conn: &Connection, username: &str) -> StoreResult<Option<String>> {
    let hash = conn
        .query_row(
            "SELECT password_hash FROM accounts WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash)
}

/// First-run check: does any account exist yet?
pub fn any_exists(conn: &Connection) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM accounts LIMIT 1", [], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn rename_account(conn: &Connection, username: &str, new_username: &str) -> StoreResult<bool> {
    let rows = conn
        .execute(
            "UPDATE accounts SET username = ?2 WHERE username = ?1",
            params![username, new_username],
        )
        .map_err(|e| map_constraint(e, "username already taken"))?;
    Ok(rows > 0)
}

pub fn set_password_hash(
    conn: &Connection,
    username: &str,
    password_hash: &str,
) -> StoreResult<bool> {
    let rows = conn.execute(
        "UPDATE accounts SET password_hash = ?2 WHERE username = ?1",
        params![username, password_hash],
    )?;
    Ok(rows > 0)
}

// Internal row type for Account mapping
struct AccountRow {
    id: String,
    username: String,
    role: String,
    created_at: String,
}

fn map_account_row(row: &Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        username: row.get(1)?,
        role: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn account_from_row(row: AccountRow) -> StoreResult<Account> {
    Ok(Account {
        id: parse_uuid(&row.id)?,
        username: row.username,
        role: Role::from_str(&row.role)?,
        created_at: parse_datetime(&row.created_at),
    })
}
