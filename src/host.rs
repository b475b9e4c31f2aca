//! Host-facing adapter over the JSON-RPC client.
//!
//! The worker crates talk to the printer through narrow traits
//! ([`MacroSink`], [`CommandSink`], [`HostFileApi`]); this module
//! implements all three over one [`RpcClient`] so the backends and the
//! sequencer stay free of transport details.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use helix_ams::MacroSink;
use helix_core::error::Result;
use helix_core::FileError;
use helix_gcode::HostFileApi;
use helix_print::CommandSink;
use helix_transport::RpcClient;

/// One client, three trait hats
pub struct HostApi {
    client: Arc<RpcClient>,
}

impl HostApi {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    /// The underlying client, for callers that need raw RPC access
    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    /// List files under a host root ("gcodes" for sliced files)
    pub async fn list_files(&self, root: &str) -> Result<Value> {
        self.client
            .call("server.files.list", Some(json!({ "root": root })), None)
            .await
    }

    /// Query the host's job history, newest first
    pub async fn history_list(&self, limit: u32, start: u32) -> Result<Value> {
        self.client
            .call(
                "server.history.list",
                Some(json!({ "limit": limit, "start": start, "order": "desc" })),
                None,
            )
            .await
    }

    /// Restart the host's printer service
    pub async fn restart_host(&self) -> Result<()> {
        self.client.call("printer.restart", None, None).await.map(|_| ())
    }

    /// Restart the firmware (full MCU reset)
    pub async fn restart_firmware(&self) -> Result<()> {
        self.client
            .call("printer.firmware_restart", None, None)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MacroSink for HostApi {
    async fn run_macro(&self, script: &str) -> Result<()> {
        self.client.gcode_script(script).await
    }
}

#[async_trait]
impl CommandSink for HostApi {
    async fn run_gcode(&self, script: &str) -> Result<()> {
        self.client.gcode_script(script).await
    }

    async fn start_print(&self, filename: &str) -> Result<()> {
        self.client
            .call(
                "printer.print.start",
                Some(json!({ "filename": filename })),
                None,
            )
            .await
            .map(|_| ())
    }

    async fn cancel_print(&self) -> Result<()> {
        self.client
            .call("printer.print.cancel", None, None)
            .await
            .map(|_| ())
    }

    async fn emergency_stop(&self) -> Result<()> {
        self.client
            .call("printer.emergency_stop", None, None)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl HostFileApi for HostApi {
    async fn download_file(&self, path: &str) -> Result<String> {
        let result = self
            .client
            .call("server.files.download", Some(json!({ "path": path })), None)
            .await?;
        match result["content"].as_str() {
            Some(content) => Ok(content.to_string()),
            None => Err(FileError::HostIo {
                path: path.to_string(),
                reason: "download reply missing content".to_string(),
            }
            .into()),
        }
    }

    async fn upload_file(&self, path: &str, content: &str) -> Result<()> {
        self.client
            .call(
                "server.files.upload",
                Some(json!({ "path": path, "content": content })),
                None,
            )
            .await
            .map(|_| ())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.client
            .call(
                "server.files.delete_file",
                Some(json!({ "path": path })),
                None,
            )
            .await
            .map(|_| ())
    }

    async fn patch_job_history(&self, job_id: &str, filename: &str) -> Result<()> {
        self.client
            .call(
                "server.history.patch_job",
                Some(json!({ "uid": job_id, "filename": filename })),
                None,
            )
            .await
            .map(|_| ())
    }
}
