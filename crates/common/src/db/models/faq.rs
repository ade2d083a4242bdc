//! FAQ entity
//!
//! Rows are written by the content backend; embeddings are produced
//! externally and stored as a JSON array of floats.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "faqs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(column_type = "Text")]
    pub question: String,

    #[sea_orm(column_type = "Text")]
    pub answer: String,

    /// Precomputed embedding; null until the producer has run
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub embedding: Option<Json>,

    /// Draft rows have no publish date and are never served
    pub published_at: Option<DateTimeWithTimeZone>,

    pub created_at: Option<DateTimeWithTimeZone>,

    pub updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
