//! # SystemSetting Repository
//!
//! Key/value settings, one row per key.

use chrono::Utc;
use sea_orm::prelude::*;
use sea_orm::Set;
use sea_orm::sea_query::OnConflict;

use crate::error::{LedgerError, map_db_err};
use crate::models::system_setting::{ActiveModel, Column, Entity};

pub const AUTO_QUEUE_KEY: &str = "auto_queue_enabled";

#[derive(Clone)]
pub struct SystemSettingRepository {
    db: DatabaseConnection,
}

impl SystemSettingRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let row = Entity::find_by_id(key.to_string())
            .one(&self.db)
            .await
            .map_err(|e| map_db_err("loading setting", e))?;
        Ok(row.map(|setting| setting.value))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), LedgerError> {
        let row = ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(Utc::now().fixed_offset()),
        };
        Entity::insert(row)
            .on_conflict(
                OnConflict::column(Column::Key)
                    .update_columns([Column::Value, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("saving setting", e))?;
        Ok(())
    }

    /// Missing or unparsable values read as `false`.
    pub async fn get_bool(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self
            .get(key)
            .await?
            .map(|value| matches!(value.trim(), "true" | "1" | "on"))
            .unwrap_or(false))
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> Result<(), LedgerError> {
        self.set(key, if value { "true" } else { "false" }).await
    }
}
