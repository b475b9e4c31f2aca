//! Out-of-place G-code amendment for the print preparation flow.
//!
//! When a sliced file embeds operations the user has disabled, the
//! modifier downloads the original from the host, comments the matching
//! lines out with a sentinel prefix, and uploads the amended copy to a
//! hidden temp directory. The returned handle deletes the temp copy when
//! dropped unless released.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use helix_core::config::ModifierConfig;
use helix_core::error::Result;

use crate::ops_detector::{classify_line, DetectedOperation, EmbeddedOp};

/// Host file API consumed by the modifier
///
/// Implemented over the transport client in production; tests supply an
/// in-memory fake.
#[async_trait]
pub trait HostFileApi: Send + Sync {
    /// Download a file from the host's gcodes root
    async fn download_file(&self, path: &str) -> Result<String>;
    /// Upload a file under the host's gcodes root, creating directories
    async fn upload_file(&self, path: &str, content: &str) -> Result<()>;
    /// Delete a file under the host's gcodes root
    async fn delete_file(&self, path: &str) -> Result<()>;
    /// Rewrite the recorded filename of a history job
    async fn patch_job_history(&self, job_id: &str, filename: &str) -> Result<()>;
}

/// RAII handle for an uploaded temp copy
///
/// Dropping the handle schedules deletion of the temp file through the
/// host API. Call [`TempFile::release`] to keep the file (debugging).
pub struct TempFile {
    host_path: String,
    original_filename: String,
    api: Arc<dyn HostFileApi>,
    owns_file: bool,
}

impl TempFile {
    /// Create a handle owning `host_path`
    pub fn new(host_path: String, original_filename: String, api: Arc<dyn HostFileApi>) -> Self {
        Self {
            host_path,
            original_filename,
            api,
            owns_file: true,
        }
    }

    /// Path of the temp copy as known to the host
    pub fn host_path(&self) -> &str {
        &self.host_path
    }

    /// User-visible name of the original file
    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    /// Whether dropping will delete the file
    pub fn owns_file(&self) -> bool {
        self.owns_file
    }

    /// Keep the temp file past this handle's lifetime
    pub fn release(&mut self) {
        self.owns_file = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.owns_file {
            return;
        }
        let api = self.api.clone();
        let path = self.host_path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = api.delete_file(&path).await {
                        tracing::warn!("Failed to delete temp file {}: {}", path, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to delete temp file {}; leaking it", path);
            }
        }
    }
}

impl std::fmt::Debug for TempFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFile")
            .field("host_path", &self.host_path)
            .field("owns_file", &self.owns_file)
            .finish()
    }
}

/// Outcome of a successful skip-copy
pub struct SkipCopyResult {
    /// Handle for the amended copy
    pub temp_file: TempFile,
    /// The individual lines that were commented out
    pub skipped: Vec<DetectedOperation>,
}

/// Creates amended copies of host G-code files
///
/// Stateless per call; safe to invoke concurrently on distinct files.
pub struct FileModifier {
    api: Arc<dyn HostFileApi>,
    config: ModifierConfig,
}

impl FileModifier {
    /// Create a modifier over a host file API
    pub fn new(api: Arc<dyn HostFileApi>, config: ModifierConfig) -> Self {
        Self { api, config }
    }

    /// Produce an amended copy with the given operations commented out
    ///
    /// Downloads `original_path`, prefixes every line matching a kind in
    /// `ops_to_skip` with the sentinel, uploads the result to the temp
    /// directory, and returns the RAII handle plus the skipped lines.
    pub async fn create_skip_copy(
        &self,
        original_path: &str,
        ops_to_skip: &BTreeSet<EmbeddedOp>,
    ) -> Result<SkipCopyResult> {
        let content = self.api.download_file(original_path).await?;

        let (modified, skipped) = self.generate_modified_content(original_path, &content, ops_to_skip);

        let temp_path = self.temp_path_for(original_path);
        self.api.upload_file(&temp_path, &modified).await?;
        tracing::info!(
            "Created skip copy {} ({} lines commented)",
            temp_path,
            skipped.len()
        );

        Ok(SkipCopyResult {
            temp_file: TempFile::new(
                temp_path,
                original_filename(original_path).to_string(),
                self.api.clone(),
            ),
            skipped,
        })
    }

    /// Pure amendment step, separated for testing
    pub fn generate_modified_content(
        &self,
        original_path: &str,
        content: &str,
        ops_to_skip: &BTreeSet<EmbeddedOp>,
    ) -> (String, Vec<DetectedOperation>) {
        let mut skipped = Vec::new();
        let mut out = String::with_capacity(content.len() + 256);

        if self.config.add_header_comment && !ops_to_skip.is_empty() {
            out.push_str(&self.header_comment(original_path, ops_to_skip));
        }

        for (idx, line) in content.split_inclusive('\n').enumerate() {
            let body = line.trim_end_matches(['\n', '\r']);
            match classify_line(body) {
                Some(op) if ops_to_skip.contains(&op) => {
                    out.push_str(&self.config.skip_prefix);
                    skipped.push(DetectedOperation {
                        op,
                        line_number: idx + 1,
                        line: body.to_string(),
                    });
                }
                _ => {}
            }
            out.push_str(line);
        }

        (out, skipped)
    }

    fn header_comment(&self, original_path: &str, ops: &BTreeSet<EmbeddedOp>) -> String {
        let names: Vec<&str> = ops.iter().map(|op| op.name()).collect();
        format!(
            "; Amended copy of {} - skipped: {}\n",
            original_filename(original_path),
            names.join(", ")
        )
    }

    fn temp_path_for(&self, original_path: &str) -> String {
        let name = original_filename(original_path);
        let stem = name.strip_suffix(".gcode").unwrap_or(name);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        format!("{}/{}_helix_{}.gcode", self.config.temp_dir, stem, nanos)
    }
}

/// Rewrites the host's job history so users see the original filename
/// rather than the hidden temp copy.
pub struct JobHistoryPatcher {
    api: Arc<dyn HostFileApi>,
}

impl JobHistoryPatcher {
    /// Create a patcher over a host file API
    pub fn new(api: Arc<dyn HostFileApi>) -> Self {
        Self { api }
    }

    /// Rewrite one job's recorded filename
    pub async fn patch_job(&self, job_id: &str, original_filename: &str) -> Result<()> {
        self.api.patch_job_history(job_id, original_filename).await
    }
}

fn original_filename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
