//! Backup Module
//!
//! Named backups of the applications cluster: the catalog, per-release
//! export/import and update-backup retention.

pub mod catalog;
pub mod exporter;
pub mod importer;
pub mod record;
pub mod retention;

pub use catalog::{Backup, BackupCatalog};
pub use exporter::ReleaseExporter;
pub use importer::{ImportOutcome, ReleaseImporter, SkipReason};
pub use record::ReleaseBackupRecord;
