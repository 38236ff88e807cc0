//! Hookline Core - Campaign scheduling, delivery and bulk import
//!
//! This crate provides the delivery worker that turns stored delivery units
//! into emails and SMS, the campaign manager that creates them, and the
//! background job engine used for target imports.

pub mod jobs;
pub mod scheduled;
pub mod token;

pub use jobs::{BulkImporter, JobManager, JobSnapshot, JobStatus};
pub use scheduled::{
    CampaignError, CampaignManager, DeliveryWorker, HttpStopHook, NoopStopHook, RedirectCipher,
    SmtpTransport, StopHook, TwilioSmsTransport,
};
