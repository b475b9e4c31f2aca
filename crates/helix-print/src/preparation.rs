//! Print preparation orchestrator.
//!
//! Assembles the pre-print workflow: reads effective capabilities and
//! user toggles, scans the chosen file for embedded operations,
//! comments out the ones the user disabled via the file modifier, queues
//! the still-missing operations, and hands the sequence to the
//! sequencer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use helix_core::error::Result;
use helix_core::{Capabilities, Capability};
use helix_gcode::modifier::{FileModifier, JobHistoryPatcher, TempFile};
use helix_gcode::ops_detector::{detect_operations, detected_kinds, EmbeddedOp};
use helix_gcode::HostFileApi;

use crate::sequencer::{
    CompleteCallback, Operation, OperationSequencer, OperationType, ProgressCallback,
};

/// User-facing pre-print toggles
///
/// A toggle only takes effect when the matching capability is
/// effectively present (or, for macros, when the macro exists).
#[derive(Debug, Clone)]
pub struct PrepOptions {
    pub home: bool,
    pub quad_gantry_level: bool,
    pub z_tilt: bool,
    pub bed_mesh: bool,
    pub nozzle_clean: bool,
    pub purge_line: bool,
    pub heat_soak: bool,
    /// Preheat the hotend before the sequence, °C
    pub extruder_target: Option<f64>,
    /// Preheat the bed before the sequence, °C
    pub bed_target: Option<f64>,
}

impl Default for PrepOptions {
    fn default() -> Self {
        Self {
            home: true,
            quad_gantry_level: true,
            z_tilt: true,
            bed_mesh: true,
            nozzle_clean: false,
            purge_line: false,
            heat_soak: false,
            extruder_target: None,
            bed_target: None,
        }
    }
}

/// Outcome of assembling a preparation flow
#[derive(Debug)]
pub struct PreparedPrint {
    /// Path actually printed; the temp copy when ops were disabled
    pub print_path: String,
    /// Operations commented out in the temp copy
    pub disabled_ops: BTreeSet<EmbeddedOp>,
    /// Display names of the queued operations, in order
    pub queued: Vec<String>,
}

/// Drives the pre-print workflow
pub struct PrintPreparation {
    sequencer: OperationSequencer,
    modifier: FileModifier,
    patcher: JobHistoryPatcher,
    api: Arc<dyn HostFileApi>,
    /// Scan results per host path, reused across prepare calls
    scan_cache: Mutex<HashMap<String, BTreeSet<EmbeddedOp>>>,
    /// Keeps the amended copy alive until the job finishes
    active_temp: Mutex<Option<TempFile>>,
}

impl PrintPreparation {
    pub fn new(
        sequencer: OperationSequencer,
        api: Arc<dyn HostFileApi>,
        modifier: FileModifier,
    ) -> Self {
        Self {
            sequencer,
            modifier,
            patcher: JobHistoryPatcher::new(api.clone()),
            api,
            scan_cache: Mutex::new(HashMap::new()),
            active_temp: Mutex::new(None),
        }
    }

    /// The operations embedded in a file, scanning at most once per path
    pub async fn scan_file(&self, path: &str) -> Result<BTreeSet<EmbeddedOp>> {
        if let Some(cached) = self.scan_cache.lock().get(path) {
            return Ok(cached.clone());
        }
        let content = self.api.download_file(path).await?;
        let kinds = detected_kinds(&detect_operations(&content));
        debug!(path, ops = kinds.len(), "Scanned file for embedded operations");
        self.scan_cache.lock().insert(path.to_string(), kinds.clone());
        Ok(kinds)
    }

    /// Forget cached scans (file list changed or file re-sliced)
    pub fn invalidate_scan(&self, path: &str) {
        self.scan_cache.lock().remove(path);
    }

    /// Assemble the workflow and start the sequencer
    ///
    /// Returns the prepared plan; the sequence itself reports through
    /// the callbacks.
    pub async fn prepare_and_start(
        &self,
        path: &str,
        options: &PrepOptions,
        caps: &Capabilities,
        on_progress: ProgressCallback,
        on_complete: CompleteCallback,
    ) -> Result<PreparedPrint> {
        let embedded = self.scan_file(path).await?;
        let wanted = effective_options(options, caps);

        // Embedded operations the user turned off get commented out of
        // a temp copy; the original file is never touched.
        let ops_to_disable: BTreeSet<EmbeddedOp> = embedded
            .difference(&wanted)
            .copied()
            .collect();

        let print_path = if ops_to_disable.is_empty() {
            path.to_string()
        } else {
            let result = self.modifier.create_skip_copy(path, &ops_to_disable).await?;
            let temp_path = result.temp_file.host_path().to_string();
            info!(
                original = path,
                temp = %temp_path,
                skipped = result.skipped.len(),
                "Printing amended copy"
            );
            *self.active_temp.lock() = Some(result.temp_file);
            temp_path
        };

        self.sequencer.clear()?;
        let mut queued = Vec::new();

        if let Some(target) = options.extruder_target {
            let op = Operation::new(
                OperationType::PreheatExtruder,
                json!({"target": target}),
                format!("Heating Extruder to {target:.0}"),
            );
            queued.push(op.display_name.clone());
            self.sequencer.add(op)?;
        }
        if let Some(target) = options.bed_target {
            let op = Operation::new(
                OperationType::PreheatBed,
                json!({"target": target}),
                format!("Heating Bed to {target:.0}"),
            );
            queued.push(op.display_name.clone());
            self.sequencer.add(op)?;
        }

        // Enabled operations the file does not already perform.
        for (embedded_kind, op) in plan_order(&wanted, caps) {
            if let Some(kind) = embedded_kind {
                if embedded.contains(&kind) {
                    continue;
                }
            }
            queued.push(op.display_name.clone());
            self.sequencer.add(op)?;
        }

        // Macro-backed extras; scans cannot detect these, so enabled
        // means queued.
        if options.heat_soak && !caps.known_macros.heat_soak.is_empty() {
            let op = Operation::new(
                OperationType::HeatSoak,
                json!({"macro": caps.known_macros.heat_soak}),
                "Heat Soak",
            );
            queued.push(op.display_name.clone());
            self.sequencer.add(op)?;
        }
        if options.purge_line && !caps.known_macros.purge_line.is_empty() {
            let op = Operation::new(
                OperationType::PurgeLine,
                json!({"macro": caps.known_macros.purge_line}),
                "Purge Line",
            );
            queued.push(op.display_name.clone());
            self.sequencer.add(op)?;
        }

        let start = Operation::new(
            OperationType::StartPrint,
            json!({"filename": print_path}),
            "Starting Print",
        );
        queued.push(start.display_name.clone());
        self.sequencer.add(start)?;

        self.sequencer.start(on_progress, on_complete);
        Ok(PreparedPrint {
            print_path,
            disabled_ops: ops_to_disable,
            queued,
        })
    }

    /// Cancel the running preparation
    pub fn cancel(&self) -> bool {
        self.sequencer.cancel()
    }

    /// Finish bookkeeping once the job reaches a terminal state
    ///
    /// Rewrites the job history to show the original filename when an
    /// amended copy was printed, then drops the temp file handle, which
    /// deletes the copy on the host.
    pub async fn finish_job(&self, job_id: &str) -> Result<()> {
        let temp = self.active_temp.lock().take();
        if let Some(temp) = temp {
            self.patcher
                .patch_job(job_id, temp.original_filename())
                .await?;
        }
        Ok(())
    }
}

/// Map enabled-and-capable options to their embedded kind and operation
///
/// The pair's first element is `None` for operations that file scans
/// cannot detect; those are always queued when enabled.
fn plan_order(
    wanted: &BTreeSet<EmbeddedOp>,
    caps: &Capabilities,
) -> Vec<(Option<EmbeddedOp>, Operation)> {
    let mut plan = Vec::new();
    if wanted.contains(&EmbeddedOp::Homing) {
        plan.push((
            Some(EmbeddedOp::Homing),
            Operation::new(OperationType::Home, json!({"axes": "xyz"}), "Homing"),
        ));
    }
    if wanted.contains(&EmbeddedOp::QuadGantryLevel) {
        plan.push((
            Some(EmbeddedOp::QuadGantryLevel),
            Operation::new(OperationType::QuadGantryLevel, json!({}), "Quad Gantry Level"),
        ));
    }
    if wanted.contains(&EmbeddedOp::ZTilt) {
        plan.push((
            Some(EmbeddedOp::ZTilt),
            Operation::new(OperationType::ZTilt, json!({}), "Z-Tilt Adjust"),
        ));
    }
    if wanted.contains(&EmbeddedOp::BedMesh) {
        plan.push((
            Some(EmbeddedOp::BedMesh),
            Operation::new(OperationType::BedMesh, json!({}), "Bed Mesh"),
        ));
    }
    if wanted.contains(&EmbeddedOp::NozzleClean) {
        plan.push((
            Some(EmbeddedOp::NozzleClean),
            Operation::new(
                OperationType::NozzleClean,
                json!({"macro": caps.known_macros.nozzle_clean}),
                "Nozzle Clean",
            ),
        ));
    }
    plan
}

/// Which options are both enabled and effectively available
///
/// Keyed by the embedded-op kind so the caller can subtract what the
/// file already does. Heat soak and purge line are appended by the
/// caller directly since scans cannot detect them.
fn effective_options(options: &PrepOptions, caps: &Capabilities) -> BTreeSet<EmbeddedOp> {
    let mut wanted = BTreeSet::new();
    if options.home {
        wanted.insert(EmbeddedOp::Homing);
    }
    if options.quad_gantry_level && caps.effective(Capability::QuadGantryLevel) {
        wanted.insert(EmbeddedOp::QuadGantryLevel);
    }
    if options.z_tilt && caps.effective(Capability::ZTilt) {
        wanted.insert(EmbeddedOp::ZTilt);
    }
    if options.bed_mesh && caps.effective(Capability::BedMesh) {
        wanted.insert(EmbeddedOp::BedMesh);
    }
    if options.nozzle_clean && !caps.known_macros.nozzle_clean.is_empty() {
        wanted.insert(EmbeddedOp::NozzleClean);
    }
    wanted
}
