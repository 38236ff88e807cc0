//! Bulk Import - Streams an uploaded CSV into a target group as a
//! cancellable background job

use super::manager::{Job, JobKind, JobManager, JobStatus};
use crate::token::random_token;
use chrono::Utc;
use csv::{ReaderBuilder, StringRecord, Trim};
use hookline_common::config::ImportConfig;
use hookline_common::types::{GroupId, Mailbox, Recipient, TargetId, UserId};
use hookline_storage::models::Group;
use hookline_storage::repository::GroupStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const FILE_TOKEN_LENGTH: usize = 16;

const ACTIVATION_WARNING: &str =
    "Import finished but failed to activate group in list. Please contact admin.";

/// Import errors
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("CSV missing required 'Email' column")]
    MissingEmailColumn,

    #[error("Failed to read CSV header: {0}")]
    Header(String),

    #[error("File token is required")]
    TokenMissing,

    #[error("Import file expired or not found")]
    FileNotFound,

    #[error("Group not found")]
    GroupNotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] hookline_common::Error),
}

impl ImportError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ImportError::MissingEmailColumn
            | ImportError::Header(_)
            | ImportError::TokenMissing => 400,
            ImportError::FileNotFound | ImportError::GroupNotFound => 404,
            ImportError::Io(_) => 500,
            ImportError::Store(e) => e.status_code(),
        }
    }
}

/// Positions of the recognised columns in a header row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Columns {
    pub first_name: Option<usize>,
    pub last_name: Option<usize>,
    pub email: Option<usize>,
    pub position: Option<usize>,
}

impl Columns {
    /// Match header names loosely: "First Name", "first_name" and
    /// "Work Email" are all recognised. Later columns win.
    pub fn detect(header: &StringRecord) -> Self {
        let mut columns = Self::default();
        for (i, name) in header.iter().enumerate() {
            let name = name.trim().to_lowercase();
            if name.contains("first") && name.contains("name") {
                columns.first_name = Some(i);
            }
            if name.contains("last") && name.contains("name") {
                columns.last_name = Some(i);
            }
            if name.contains("email") {
                columns.email = Some(i);
            }
            if name.contains("position") {
                columns.position = Some(i);
            }
        }
        columns
    }

    fn field(record: &StringRecord, index: Option<usize>) -> String {
        index
            .and_then(|i| record.get(i))
            .unwrap_or_default()
            .to_string()
    }

    /// Raw row values, unvalidated
    pub fn extract(&self, record: &StringRecord) -> Recipient {
        Recipient {
            email: Self::field(record, self.email),
            first_name: Self::field(record, self.first_name),
            last_name: Self::field(record, self.last_name),
            position: Self::field(record, self.position),
        }
    }
}

/// Result of staging an upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadPreview {
    pub file_token: String,
    pub preview: Vec<Recipient>,
    pub total_count: usize,
    pub message: String,
}

/// Request to import a staged upload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group_type: String,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub file_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitResponse {
    pub job_id: String,
    pub group_id: GroupId,
}

/// What an import run did, including every id it wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub status: JobStatus,
    /// Rows in batches that were stored
    pub inserted: u64,
    pub duplicates: u64,
    pub added_targets: Vec<TargetId>,
    pub added_links: Vec<TargetId>,
}

/// A parsed row, or a row-level read error
type RowResult = Result<StringRecord, String>;

/// Bulk importer
pub struct BulkImporter {
    groups: Arc<dyn GroupStore>,
    jobs: Arc<JobManager>,
    config: ImportConfig,
}

impl BulkImporter {
    pub fn new(groups: Arc<dyn GroupStore>, jobs: Arc<JobManager>, config: ImportConfig) -> Self {
        Self { groups, jobs, config }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    fn staged_path(&self, token: &str) -> PathBuf {
        self.config.upload_dir.join(format!("import_{}.csv", token))
    }

    /// Store an uploaded CSV and return a preview of its rows
    pub async fn stage_upload(&self, content: &[u8]) -> Result<UploadPreview, ImportError> {
        let mut reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(content);

        let header = reader
            .headers()
            .map_err(|e| ImportError::Header(e.to_string()))?
            .clone();
        let columns = Columns::detect(&header);
        if columns.email.is_none() {
            return Err(ImportError::MissingEmailColumn);
        }

        let mut preview = Vec::new();
        let mut total_count = 0;
        for record in reader.records().flatten() {
            total_count += 1;
            if preview.len() < self.config.preview_rows {
                preview.push(columns.extract(&record));
            }
        }

        let file_token = random_token(FILE_TOKEN_LENGTH);
        tokio::fs::write(self.staged_path(&file_token), content).await?;

        info!(file_token = %file_token, "Staged import file with {} records", total_count);

        Ok(UploadPreview {
            file_token,
            preview,
            total_count,
            message: format!("File uploaded. {} records found.", total_count),
        })
    }

    /// Resolve the destination group, register a job and start importing.
    /// Returns as soon as the job is running.
    pub async fn commit(
        self: &Arc<Self>,
        user_id: UserId,
        request: CommitRequest,
    ) -> Result<(CommitResponse, JoinHandle<ImportReport>), ImportError> {
        if request.file_token.is_empty() {
            return Err(ImportError::TokenMissing);
        }
        // Tokens are generated alphanumeric, anything else cannot name a staged file
        if !request.file_token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ImportError::FileNotFound);
        }
        let path = self.staged_path(&request.file_token);
        if !tokio::fs::try_exists(&path).await? {
            return Err(ImportError::FileNotFound);
        }

        let (group, is_new) = self.resolve_group(user_id, &request).await?;

        let job = self.jobs.create_job(user_id, JobKind::Import).await;
        info!(job_id = %job.id, group_id = %group.id, "Starting bulk import");

        let response = CommitResponse {
            job_id: job.id.clone(),
            group_id: group.id,
        };

        let importer = self.clone();
        let handle = tokio::spawn(async move { importer.run(job, path, group.id, is_new).await });

        Ok((response, handle))
    }

    async fn resolve_group(
        &self,
        user_id: UserId,
        request: &CommitRequest,
    ) -> Result<(Group, bool), ImportError> {
        let name = request.name.trim();

        let existing = match request.group_id {
            Some(id) => Some(
                self.groups
                    .get_group(id)
                    .await?
                    .filter(|g| g.user_id == user_id)
                    .ok_or(ImportError::GroupNotFound)?,
            ),
            None if !name.is_empty() => self.groups.find_group_by_name(user_id, name).await?,
            None => None,
        };

        if let Some(group) = existing {
            let rename = (!name.is_empty()).then_some(name);
            self.groups
                .update_group(group.id, rename, &request.group_type)
                .await?;
            return Ok((group, false));
        }

        let name = if name.is_empty() {
            format!("Imported Group {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))
        } else {
            name.to_string()
        };
        let group = self
            .groups
            .create_group_shell(user_id, &name, &request.group_type)
            .await?;
        Ok((group, true))
    }

    /// Import a staged file into `group_id`, then remove the file
    pub async fn run(
        &self,
        job: Arc<Job>,
        path: PathBuf,
        group_id: GroupId,
        is_new: bool,
    ) -> ImportReport {
        let mut run = ImportRun {
            importer: self,
            job: &job,
            group_id,
            is_new,
            added_targets: Vec::new(),
            added_links: Vec::new(),
            inserted: 0,
            duplicates: 0,
        };

        let status = match run.execute(&path).await {
            Ok(status) => status,
            Err(e) => {
                error!(job_id = %job.id, "Bulk import failed: {}", e);
                job.fail(e.to_string()).await;
                run.cleanup().await;
                JobStatus::Failed
            }
        };

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(job_id = %job.id, "Failed to remove import file: {}", e);
        }

        ImportReport {
            status,
            inserted: run.inserted,
            duplicates: run.duplicates,
            added_targets: run.added_targets,
            added_links: run.added_links,
        }
    }
}

/// State of one import, owned by the task running it
struct ImportRun<'a> {
    importer: &'a BulkImporter,
    job: &'a Job,
    group_id: GroupId,
    is_new: bool,
    added_targets: Vec<TargetId>,
    added_links: Vec<TargetId>,
    inserted: u64,
    duplicates: u64,
}

impl ImportRun<'_> {
    async fn execute(&mut self, path: &Path) -> Result<JobStatus, ImportError> {
        let importer = self.importer;
        let config = &importer.config;
        let started = Instant::now();

        let lines = count_records(path.to_path_buf()).await?;
        let total = lines.saturating_sub(1);

        let mut rows = stream_records(path.to_path_buf());
        let header = match rows.recv().await {
            Some(Ok(header)) => header,
            Some(Err(e)) => return Err(ImportError::Header(e)),
            None => return Err(ImportError::Header("empty file".to_string())),
        };
        self.job.update_progress(0, total).await;

        let columns = Columns::detect(&header);
        if columns.email.is_none() {
            return Err(ImportError::MissingEmailColumn);
        }

        let interval = config.cancel_check_interval.max(1);
        let mut processed: u64 = 0;
        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(config.batch_size);

        loop {
            if processed % interval == 0 && self.job.is_cancelled().await {
                return Ok(self.cancel("scan").await);
            }

            let Some(row) = rows.recv().await else {
                break;
            };
            processed += 1;

            let record = match row {
                Ok(record) => record,
                Err(e) => {
                    self.job.add_error(format!("Error reading line: {}", e)).await;
                    continue;
                }
            };

            let mut recipient = columns.extract(&record);
            match Mailbox::parse(&recipient.email) {
                Some(mailbox) => recipient.email = mailbox.address.to_string(),
                None => continue,
            }

            if !seen.insert(recipient.email.clone()) {
                self.duplicates += 1;
                if processed % 100 == 0 {
                    self.job.update_progress(processed, total).await;
                }
                continue;
            }

            batch.push(recipient);
            if batch.len() >= config.batch_size {
                self.flush(&mut batch, "Batch insert failed").await;
                self.job.update_progress(processed, total).await;
                tokio::time::sleep(Duration::from_millis(config.yield_ms)).await;
            }
        }

        if self.job.is_cancelled().await {
            return Ok(self.cancel("final batch").await);
        }
        if !batch.is_empty() {
            self.flush(&mut batch, "Final batch insert failed").await;
            self.job.update_progress(processed, total).await;
        }
        if self.job.is_cancelled().await {
            return Ok(self.cancel("finalization").await);
        }

        if let Err(e) = importer.groups.set_group_active(self.group_id, true).await {
            error!(
                job_id = %self.job.id,
                group_id = %self.group_id,
                "Failed to activate group: {}", e
            );
            self.job.add_error(ACTIVATION_WARNING).await;
        }

        let result = format!(
            "Imported {} targets in {:.2?} ({} duplicates skipped)",
            self.inserted,
            started.elapsed(),
            self.duplicates
        );
        info!(job_id = %self.job.id, "Bulk import completed: {}", result);
        self.job.complete(result).await;

        Ok(JobStatus::Completed)
    }

    async fn flush(&mut self, batch: &mut Vec<Recipient>, context: &str) {
        let rows = std::mem::take(batch);
        match self.importer.groups.bulk_insert_targets(self.group_id, &rows).await {
            Ok(outcome) => {
                self.inserted += rows.len() as u64;
                self.added_targets.extend(outcome.added_targets);
                self.added_links.extend(outcome.added_links);
            }
            Err(e) => {
                warn!(job_id = %self.job.id, "{}: {}", context, e);
                self.job.add_error(format!("{}: {}", context, e)).await;
            }
        }
    }

    async fn cancel(&mut self, stage: &str) -> JobStatus {
        info!(
            job_id = %self.job.id,
            "Bulk import cancelled during {}. Cleaning up {} targets and {} links.",
            stage,
            self.added_targets.len(),
            self.added_links.len()
        );
        self.cleanup().await;
        JobStatus::Cancelled
    }

    /// Delete everything this run added, in bounded chunks
    async fn cleanup(&mut self) {
        let groups = &self.importer.groups;
        let chunk_size = self.importer.config.cleanup_chunk_size.max(1);

        for chunk in self.added_links.chunks(chunk_size) {
            if let Err(e) = groups.delete_group_links(self.group_id, chunk).await {
                error!(job_id = %self.job.id, "Failed to delete group links: {}", e);
            }
        }
        for chunk in self.added_targets.chunks(chunk_size) {
            if let Err(e) = groups.delete_targets(chunk).await {
                error!(job_id = %self.job.id, "Failed to delete targets: {}", e);
            }
        }
        if self.is_new {
            info!(job_id = %self.job.id, group_id = %self.group_id, "Deleting new group shell");
            if let Err(e) = groups.delete_group(self.group_id).await {
                error!(job_id = %self.job.id, "Failed to delete group shell: {}", e);
            }
        }
    }
}

fn csv_reader(path: &Path, has_headers: bool) -> Result<csv::Reader<std::fs::File>, ImportError> {
    let file = std::fs::File::open(path)?;
    Ok(ReaderBuilder::new()
        .has_headers(has_headers)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(file))
}

/// First pass: count readable records, header included
async fn count_records(path: PathBuf) -> Result<u64, ImportError> {
    tokio::task::spawn_blocking(move || {
        let mut reader = csv_reader(&path, false)?;
        Ok(reader.records().filter(|r| r.is_ok()).count() as u64)
    })
    .await
    .map_err(|e| ImportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Second pass: the header row first, then every record, read on a
/// blocking thread
fn stream_records(path: PathBuf) -> mpsc::Receiver<RowResult> {
    let (tx, rx) = mpsc::channel(256);

    tokio::task::spawn_blocking(move || {
        let mut reader = match csv_reader(&path, true) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = tx.blocking_send(Err(e.to_string()));
                return;
            }
        };

        let header = reader.headers().map(|h| h.clone()).map_err(|e| e.to_string());
        let header_ok = header.is_ok();
        if tx.blocking_send(header).is_err() || !header_ok {
            return;
        }

        for record in reader.records() {
            if tx.blocking_send(record.map_err(|e| e.to_string())).is_err() {
                return;
            }
        }
    });

    rx
}
