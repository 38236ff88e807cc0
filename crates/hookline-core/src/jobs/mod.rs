//! Background jobs - Job registry and the bulk target import

mod import;
mod manager;

pub use import::{
    BulkImporter, Columns, CommitRequest, CommitResponse, ImportError, ImportReport, UploadPreview,
};
pub use manager::{Job, JobKind, JobManager, JobSnapshot, JobStatus};
