//! SeaORM entity model used by the local document store.
//!
//! One table, `income_entries`, keyed by (`owner`, `id`). `owner` is the user
//! stamped on the entry, or the empty string for unstamped entries, so the
//! same entry id may exist once per user.

use sea_orm::entity::prelude::*;

/// Income entries table entity model.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "income_entries")]
pub struct Model {
    /// Owning user id, empty for unstamped entries
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner: String,
    /// Client-generated entry id
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// User id as stamped on the entry
    pub user_id: Option<String>,
    /// Income type as its wire string (`job` / `ssi`)
    pub kind: String,
    pub amount: f64,
    /// ISO 8601 date
    pub date: String,
    pub description: String,
    /// Creation instant in epoch milliseconds
    pub timestamp: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Schema statements applied, in order, when the store is opened.
pub const CREATE_SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS income_entries (
        owner TEXT NOT NULL,
        id TEXT NOT NULL,
        user_id TEXT,
        kind TEXT NOT NULL,
        amount REAL NOT NULL,
        date TEXT NOT NULL,
        description TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (owner, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_income_entries_date ON income_entries (date)",
];
