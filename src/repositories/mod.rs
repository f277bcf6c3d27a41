//! # Repository Layer
//!
//! Thin wrappers around SeaORM operations for the ledger tables. Every
//! method that changes state filters on the expected current state, so two
//! writers racing on the same row cannot both win.

pub mod job;
pub mod job_item;
pub mod system_setting;

pub use job::JobRepository;
pub use job_item::JobItemRepository;
pub use system_setting::SystemSettingRepository;
