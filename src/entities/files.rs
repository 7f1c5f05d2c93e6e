use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A committed, fully verified upload. Rows exist only for artifacts that passed
/// integrity, scan and classification checks.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub owner_id: String,
    /// Relative to the storage root: `<owner>/<uuid>/<name>`
    #[sea_orm(unique)]
    pub storage_path: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub sha256: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::OwnerId",
        to = "super::users::Column::Id",
        on_delete = "Cascade"
    )]
    Users,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
