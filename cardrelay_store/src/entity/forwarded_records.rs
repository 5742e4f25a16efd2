use sea_orm::entity::prelude::*;

/// One row per fingerprint ever forwarded (or being forwarded).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "forwarded_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub fingerprint: String,
    pub card_number: Option<String>,
    pub provider: String,
    pub unit_amount: Option<i64>,
    pub unit_kind: Option<String>,
    pub unit_confidence: Option<String>,
    pub completeness: String,
    /// Null until the publisher confirms the forward.
    pub forwarded_message_id: Option<i32>,
    pub source_channel: i64,
    pub card_date: Date,
    pub created_at: DateTime,
    pub last_amended_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
