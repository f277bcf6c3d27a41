//! Database migrations for the job ledger.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_10_01_000001_create_jobs;
mod m2025_10_01_000002_create_job_items;
mod m2025_10_01_000003_create_system_settings;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_10_01_000001_create_jobs::Migration),
            Box::new(m2025_10_01_000002_create_job_items::Migration),
            Box::new(m2025_10_01_000003_create_system_settings::Migration),
        ]
    }
}
