//! Operation sequencer.
//!
//! Executes queued printer operations one at a time. Completion is
//! decided by observing host status deltas, not by RPC replies: each
//! operation type carries a predicate over the merged state shadow.
//! Cancellation is two-level with a 5-second escalation window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use helix_core::error::{Result, SequencerError};
use helix_core::merge_delta;

/// Seconds inside which a repeat cancel escalates
const CANCEL_ESCALATION_WINDOW: Duration = Duration::from_secs(5);

/// Command surface the sequencer drives
///
/// Implemented by the transport layer; kept behind a trait so sequences
/// run against a recorder in tests.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Run a G-code script and wait for the host acknowledgement
    async fn run_gcode(&self, script: &str) -> Result<()>;

    /// Start printing a file already on the host
    async fn start_print(&self, filename: &str) -> Result<()>;

    /// Cancel the active print gracefully
    async fn cancel_print(&self) -> Result<()>;

    /// Immediate firmware emergency stop
    async fn emergency_stop(&self) -> Result<()>;
}

/// Operations the sequencer can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// G28 homing
    Home,
    /// Quad gantry level
    QuadGantryLevel,
    /// Z-tilt adjust
    ZTilt,
    /// Bed mesh calibration
    BedMesh,
    /// Heat the hotend to a target
    PreheatExtruder,
    /// Heat the bed to a target
    PreheatBed,
    /// Heat the chamber to a target and wait for it
    ChamberSoak,
    /// Load a saved bed-mesh profile
    LoadMeshProfile,
    /// Run the nozzle cleaning macro
    NozzleClean,
    /// Run the purge / prime line macro
    PurgeLine,
    /// Run the heat soak macro
    HeatSoak,
    /// Start the print job
    StartPrint,
}

impl OperationType {
    /// Per-type default timeout: heating 10 min, bed mesh 15 min,
    /// everything else 5 min.
    pub fn default_timeout(&self) -> Duration {
        match self {
            OperationType::PreheatExtruder
            | OperationType::PreheatBed
            | OperationType::ChamberSoak
            | OperationType::HeatSoak => Duration::from_secs(600),
            OperationType::BedMesh => Duration::from_secs(900),
            _ => Duration::from_secs(300),
        }
    }
}

/// One queued operation
#[derive(Debug, Clone)]
pub struct Operation {
    pub op_type: OperationType,
    /// Type-specific parameters: `axes`, `target`, `heater`, `macro`,
    /// `filename`
    pub params: Value,
    pub display_name: String,
    pub timeout: Duration,
}

impl Operation {
    pub fn new(op_type: OperationType, params: Value, display_name: impl Into<String>) -> Self {
        Self {
            op_type,
            params,
            display_name: display_name.into(),
            timeout: op_type.default_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Sequencer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SequencerState {
    Idle = 0,
    Running = 1,
    Waiting = 2,
    Cancelling = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl SequencerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SequencerState::Running,
            2 => SequencerState::Waiting,
            3 => SequencerState::Cancelling,
            4 => SequencerState::Completed,
            5 => SequencerState::Failed,
            6 => SequencerState::Cancelled,
            _ => SequencerState::Idle,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequencerState::Completed | SequencerState::Failed | SequencerState::Cancelled
        )
    }

    fn is_active(&self) -> bool {
        matches!(
            self,
            SequencerState::Running | SequencerState::Waiting | SequencerState::Cancelling
        )
    }
}

/// Progress callback: (current step, total steps, display name)
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;
/// Completion callback: (success, message); must be idempotent
pub type CompleteCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

enum OpOutcome {
    Done,
    Cancelled,
    Failed(String),
}

type Predicate = Box<dyn FnMut(&Value) -> bool + Send>;

struct ActiveOp {
    predicate: Predicate,
    done_tx: Option<oneshot::Sender<OpOutcome>>,
}

struct SeqInner {
    sink: Arc<dyn CommandSink>,
    queue: Mutex<VecDeque<Operation>>,
    state: AtomicU8,
    shadow: Mutex<Value>,
    active: Mutex<Option<ActiveOp>>,
    current_step: AtomicUsize,
    total_steps: AtomicUsize,
    on_progress: Mutex<Option<ProgressCallback>>,
    on_complete: Mutex<Option<CompleteCallback>>,
    last_cancel: Mutex<Option<Instant>>,
    escalated: Mutex<bool>,
}

/// Executes operations one at a time with state-observed completion
#[derive(Clone)]
pub struct OperationSequencer {
    inner: Arc<SeqInner>,
}

impl OperationSequencer {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        Self {
            inner: Arc::new(SeqInner {
                sink,
                queue: Mutex::new(VecDeque::new()),
                state: AtomicU8::new(SequencerState::Idle as u8),
                shadow: Mutex::new(Value::Object(Default::default())),
                active: Mutex::new(None),
                current_step: AtomicUsize::new(0),
                total_steps: AtomicUsize::new(0),
                on_progress: Mutex::new(None),
                on_complete: Mutex::new(None),
                last_cancel: Mutex::new(None),
                escalated: Mutex::new(false),
            }),
        }
    }

    pub fn state(&self) -> SequencerState {
        SequencerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// (current step, total steps)
    pub fn progress(&self) -> (usize, usize) {
        (
            self.inner.current_step.load(Ordering::SeqCst),
            self.inner.total_steps.load(Ordering::SeqCst),
        )
    }

    /// Append an operation; forbidden while a sequence runs
    pub fn add(&self, op: Operation) -> Result<()> {
        if self.state().is_active() {
            return Err(SequencerError::QueueLocked.into());
        }
        self.inner.queue.lock().push_back(op);
        Ok(())
    }

    /// Empty the queue; forbidden while a sequence runs
    pub fn clear(&self) -> Result<()> {
        if self.state().is_active() {
            return Err(SequencerError::QueueLocked.into());
        }
        self.inner.queue.lock().clear();
        Ok(())
    }

    /// Begin executing the queue
    ///
    /// Returns false when already running or the queue is empty. A
    /// terminal sequencer resets to run the new queue.
    pub fn start(&self, on_progress: ProgressCallback, on_complete: CompleteCallback) -> bool {
        if self.state().is_active() || self.inner.queue.lock().is_empty() {
            return false;
        }
        *self.inner.on_progress.lock() = Some(on_progress);
        *self.inner.on_complete.lock() = Some(on_complete);
        *self.inner.last_cancel.lock() = None;
        *self.inner.escalated.lock() = false;
        let total = self.inner.queue.lock().len();
        self.inner.current_step.store(0, Ordering::SeqCst);
        self.inner.total_steps.store(total, Ordering::SeqCst);
        self.inner.set_state(SequencerState::Running);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_sequence(inner).await;
        });
        true
    }

    /// Merge a host status delta and evaluate the active predicate
    ///
    /// Field updates within one delta apply atomically: the shadow is
    /// merged under the lock before any evaluation.
    pub fn process_status_update(&self, delta: &Value) {
        {
            let mut shadow = self.inner.shadow.lock();
            merge_delta(&mut shadow, delta);
        }
        self.inner.evaluate_active();
    }

    /// Request cancellation
    ///
    /// First call: graceful stop and CANCELLING. Second call within the
    /// 5-second window: emergency stop, exactly once. Further calls in
    /// the window are no-ops. Returns whether the call had any effect.
    pub fn cancel(&self) -> bool {
        let now = Instant::now();
        match self.state() {
            SequencerState::Running | SequencerState::Waiting => {
                info!("Cancel requested, stopping gracefully");
                self.inner.set_state(SequencerState::Cancelling);
                *self.inner.last_cancel.lock() = Some(now);
                *self.inner.escalated.lock() = false;
                let sink = self.inner.sink.clone();
                tokio::spawn(async move {
                    // Host-level print cancel plus a motion drain.
                    let _ = sink.cancel_print().await;
                    let _ = sink.run_gcode("M400").await;
                });
                true
            }
            SequencerState::Cancelling => {
                let within_window = self
                    .inner
                    .last_cancel
                    .lock()
                    .map(|t| now.duration_since(t) <= CANCEL_ESCALATION_WINDOW)
                    .unwrap_or(false);
                let mut escalated = self.inner.escalated.lock();
                if within_window && *escalated {
                    return false;
                }
                if within_window {
                    warn!("Second cancel inside window, escalating to emergency stop");
                    *escalated = true;
                } else {
                    // Window expired without settling; start a fresh
                    // escalation cycle from the hard stop.
                    warn!("Cancel window expired, issuing emergency stop");
                    *escalated = true;
                }
                *self.inner.last_cancel.lock() = Some(now);
                let sink = self.inner.sink.clone();
                tokio::spawn(async move {
                    let _ = sink.emergency_stop().await;
                });
                true
            }
            _ => false,
        }
    }

    /// Terminate the active sequence because the host shut down
    pub fn notify_host_shutdown(&self, reason: &str) {
        if self.state().is_active() {
            self.inner
                .finish_active(OpOutcome::Failed(format!("host shutdown: {reason}")));
        }
    }

    /// Snapshot of the merged state shadow
    pub fn shadow(&self) -> Value {
        self.inner.shadow.lock().clone()
    }
}

impl SeqInner {
    fn set_state(&self, state: SequencerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn get_state(&self) -> SequencerState {
        SequencerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn report_progress(&self, step: usize, total: usize, name: &str) {
        let cb = self.on_progress.lock().clone();
        if let Some(cb) = cb {
            cb(step, total, name);
        }
    }

    fn report_complete(&self, success: bool, message: &str) {
        // Taking the callback makes completion fire exactly once.
        let cb = self.on_complete.lock().take();
        if let Some(cb) = cb {
            cb(success, message);
        }
    }

    /// Evaluate the active predicate against the shadow
    fn evaluate_active(&self) {
        let state = self.get_state();
        if state != SequencerState::Waiting && state != SequencerState::Cancelling {
            return;
        }
        let shadow = self.shadow.lock().clone();

        if state == SequencerState::Cancelling && cancel_settled(&shadow) {
            self.finish_active(OpOutcome::Cancelled);
            return;
        }

        let mut active = self.active.lock();
        if let Some(op) = active.as_mut() {
            if (op.predicate)(&shadow) {
                if let Some(tx) = op.done_tx.take() {
                    let outcome = if state == SequencerState::Cancelling {
                        OpOutcome::Cancelled
                    } else {
                        OpOutcome::Done
                    };
                    let _ = tx.send(outcome);
                }
            }
        }
    }

    fn finish_active(&self, outcome: OpOutcome) {
        if let Some(op) = self.active.lock().as_mut() {
            if let Some(tx) = op.done_tx.take() {
                let _ = tx.send(outcome);
            }
        }
    }
}

/// Whether the host has settled after a graceful cancel
fn cancel_settled(shadow: &Value) -> bool {
    matches!(
        shadow["print_stats"]["state"].as_str(),
        Some("standby") | Some("cancelled") | Some("error") | Some("complete")
    )
}

async fn run_sequence(inner: Arc<SeqInner>) {
    let total = inner.total_steps.load(Ordering::SeqCst);
    loop {
        if inner.get_state() == SequencerState::Cancelling {
            inner.set_state(SequencerState::Cancelled);
            inner.report_complete(false, "cancelled");
            return;
        }
        let Some(op) = inner.queue.lock().pop_front() else {
            inner.set_state(SequencerState::Completed);
            info!("Sequence completed");
            inner.report_progress(total, total, "");
            inner.report_complete(true, "");
            return;
        };

        let step = inner.current_step.fetch_add(1, Ordering::SeqCst) + 1;
        info!(step, total, name = %op.display_name, "Executing operation");
        inner.report_progress(step, total, &op.display_name);

        // Install the waiter before sending so a delta racing the reply
        // cannot be missed.
        let (tx, rx) = oneshot::channel();
        let predicate = build_predicate(&op);
        let observed = predicate.is_some();
        if let Some(predicate) = predicate {
            *inner.active.lock() = Some(ActiveOp {
                predicate,
                done_tx: Some(tx),
            });
        }

        if let Err(e) = send_command(&inner, &op).await {
            *inner.active.lock() = None;
            inner.set_state(SequencerState::Failed);
            let message = format!("'{}' failed: {e}", op.display_name);
            warn!(%message, "Sequence failed");
            inner.report_complete(false, &message);
            return;
        }

        if !observed {
            // Macro operations complete with the host reply itself.
            debug!(name = %op.display_name, "Operation complete on reply");
            continue;
        }

        if inner.get_state() != SequencerState::Cancelling {
            inner.set_state(SequencerState::Waiting);
        }
        // The shadow may already satisfy the predicate.
        inner.evaluate_active();

        let outcome = tokio::time::timeout(op.timeout, rx).await;
        *inner.active.lock() = None;
        match outcome {
            Ok(Ok(OpOutcome::Done)) => {
                debug!(name = %op.display_name, "Operation complete");
                if inner.get_state() == SequencerState::Waiting {
                    inner.set_state(SequencerState::Running);
                }
            }
            Ok(Ok(OpOutcome::Cancelled)) | Ok(Err(_)) => {
                inner.set_state(SequencerState::Cancelled);
                info!("Sequence cancelled");
                inner.report_complete(false, "cancelled");
                return;
            }
            Ok(Ok(OpOutcome::Failed(message))) => {
                inner.set_state(SequencerState::Failed);
                warn!(%message, "Sequence failed");
                inner.report_complete(false, &message);
                return;
            }
            Err(_) => {
                if inner.get_state() == SequencerState::Cancelling {
                    inner.set_state(SequencerState::Cancelled);
                    inner.report_complete(false, "cancelled");
                    return;
                }
                inner.set_state(SequencerState::Failed);
                let message = format!(
                    "'{}' timed out after {}ms",
                    op.display_name,
                    op.timeout.as_millis()
                );
                warn!(%message, "Sequence failed");
                inner.report_complete(false, &message);
                return;
            }
        }
    }
}

async fn send_command(inner: &Arc<SeqInner>, op: &Operation) -> Result<()> {
    match op.op_type {
        OperationType::Home => {
            let axes = op.params["axes"].as_str().unwrap_or("");
            let script = if axes.is_empty() {
                "G28".to_string()
            } else {
                let letters: Vec<String> = axes
                    .chars()
                    .map(|c| c.to_ascii_uppercase().to_string())
                    .collect();
                format!("G28 {}", letters.join(" "))
            };
            inner.sink.run_gcode(&script).await
        }
        OperationType::QuadGantryLevel => inner.sink.run_gcode("QUAD_GANTRY_LEVEL").await,
        OperationType::ZTilt => inner.sink.run_gcode("Z_TILT_ADJUST").await,
        OperationType::BedMesh => inner.sink.run_gcode("BED_MESH_CALIBRATE").await,
        OperationType::PreheatExtruder | OperationType::PreheatBed => {
            let default_heater = if op.op_type == OperationType::PreheatExtruder {
                "extruder"
            } else {
                "heater_bed"
            };
            let heater = op.params["heater"].as_str().unwrap_or(default_heater);
            let target = op.params["target"].as_f64().unwrap_or(0.0);
            inner
                .sink
                .run_gcode(&format!(
                    "SET_HEATER_TEMPERATURE HEATER={heater} TARGET={target}"
                ))
                .await
        }
        OperationType::ChamberSoak => {
            let heater = op.params["heater"].as_str().unwrap_or("chamber");
            let target = op.params["target"].as_f64().unwrap_or(0.0);
            inner
                .sink
                .run_gcode(&format!(
                    "SET_HEATER_TEMPERATURE HEATER={heater} TARGET={target}"
                ))
                .await
        }
        OperationType::LoadMeshProfile => {
            let profile = op.params["profile"].as_str().unwrap_or("");
            if profile.is_empty() {
                return Err(helix_core::Error::InvalidArgument(
                    "load-mesh-profile operation has no profile name".to_string(),
                ));
            }
            inner
                .sink
                .run_gcode(&format!("BED_MESH_PROFILE LOAD={profile}"))
                .await
        }
        OperationType::NozzleClean | OperationType::PurgeLine | OperationType::HeatSoak => {
            let script = op.params["macro"].as_str().unwrap_or("");
            if script.is_empty() {
                return Err(helix_core::Error::InvalidArgument(format!(
                    "operation '{}' has no macro configured",
                    op.display_name
                )));
            }
            inner.sink.run_gcode(script).await
        }
        OperationType::StartPrint => {
            let filename = op.params["filename"].as_str().unwrap_or("");
            if filename.is_empty() {
                return Err(helix_core::Error::InvalidArgument(
                    "start-print operation has no filename".to_string(),
                ));
            }
            inner.sink.start_print(filename).await
        }
    }
}

/// Build the completion predicate for an operation
///
/// `None` means the operation completes with the RPC reply (blocking
/// host macros). Predicates may carry state: heating requires the
/// near-target condition on two consecutive deltas.
fn build_predicate(op: &Operation) -> Option<Predicate> {
    match op.op_type {
        OperationType::Home => {
            let required: Vec<char> = op
                .params["axes"]
                .as_str()
                .filter(|s| !s.is_empty())
                .unwrap_or("xyz")
                .to_lowercase()
                .chars()
                .collect();
            Some(Box::new(move |shadow| {
                let homed = shadow["toolhead"]["homed_axes"].as_str().unwrap_or("");
                let homed = homed.to_lowercase();
                required.iter().all(|a| homed.contains(*a))
            }))
        }
        OperationType::QuadGantryLevel => Some(Box::new(|shadow| {
            shadow["quad_gantry_level"]["applied"].as_bool() == Some(true)
        })),
        OperationType::ZTilt => Some(Box::new(|shadow| {
            shadow["z_tilt"]["applied"].as_bool() == Some(true)
        })),
        OperationType::BedMesh => Some(Box::new(|shadow| {
            // Firmware versions disagree on a final "applied" field;
            // a non-empty active profile is the stable signal.
            shadow["bed_mesh"]["profile_name"]
                .as_str()
                .map(|p| !p.is_empty())
                .unwrap_or(false)
        })),
        OperationType::PreheatExtruder | OperationType::PreheatBed => {
            let default_heater = if op.op_type == OperationType::PreheatExtruder {
                "extruder"
            } else {
                "heater_bed"
            };
            let heater = op.params["heater"]
                .as_str()
                .unwrap_or(default_heater)
                .to_string();
            let target = op.params["target"].as_f64().unwrap_or(0.0);
            let mut consecutive = 0u32;
            Some(Box::new(move |shadow| {
                let current = shadow[&heater]["temperature"].as_f64().unwrap_or(f64::MIN);
                if current >= target - 1.0 {
                    consecutive += 1;
                } else {
                    consecutive = 0;
                }
                consecutive >= 2
            }))
        }
        OperationType::ChamberSoak => {
            // The command names the heater "chamber"; status updates
            // report it under the full config section name.
            let object = op.params["object"]
                .as_str()
                .unwrap_or("heater_generic chamber")
                .to_string();
            let target = op.params["target"].as_f64().unwrap_or(0.0);
            let mut consecutive = 0u32;
            Some(Box::new(move |shadow| {
                let current = shadow[&object]["temperature"].as_f64().unwrap_or(f64::MIN);
                if current >= target - 1.0 {
                    consecutive += 1;
                } else {
                    consecutive = 0;
                }
                consecutive >= 2
            }))
        }
        OperationType::LoadMeshProfile => {
            let profile = op.params["profile"].as_str().unwrap_or("").to_string();
            Some(Box::new(move |shadow| {
                shadow["bed_mesh"]["profile_name"].as_str() == Some(profile.as_str())
            }))
        }
        OperationType::StartPrint => Some(Box::new(|shadow| {
            shadow["print_stats"]["state"].as_str() == Some("printing")
        })),
        OperationType::NozzleClean | OperationType::PurgeLine | OperationType::HeatSoak => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[derive(Default)]
    struct FakeSink {
        gcode: Mutex<Vec<String>>,
        prints: Mutex<Vec<String>>,
        cancels: AtomicUsize,
        estops: AtomicUsize,
    }

    #[async_trait]
    impl CommandSink for FakeSink {
        async fn run_gcode(&self, script: &str) -> Result<()> {
            self.gcode.lock().push(script.to_string());
            Ok(())
        }
        async fn start_print(&self, filename: &str) -> Result<()> {
            self.prints.lock().push(filename.to_string());
            Ok(())
        }
        async fn cancel_print(&self) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn emergency_stop(&self) -> Result<()> {
            self.estops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Capture {
        progress: Arc<Mutex<Vec<(usize, usize, String)>>>,
        complete: Arc<Mutex<Vec<(bool, String)>>>,
    }

    fn start_captured(seq: &OperationSequencer) -> Capture {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let complete = Arc::new(Mutex::new(Vec::new()));
        let p = progress.clone();
        let c = complete.clone();
        assert!(seq.start(
            Arc::new(move |step, total, name| {
                p.lock().push((step, total, name.to_string()));
            }),
            Arc::new(move |ok, msg| {
                c.lock().push((ok, msg.to_string()));
            }),
        ));
        Capture { progress, complete }
    }

    async fn settle() {
        sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_homing_sequence_completes() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink.clone());
        seq.add(Operation::new(
            OperationType::Home,
            json!({"axes": "xyz"}),
            "Homing",
        ))
        .unwrap();

        let cap = start_captured(&seq);
        settle().await;
        assert_eq!(seq.state(), SequencerState::Waiting);
        assert_eq!(sink.gcode.lock().as_slice(), ["G28 X Y Z"]);

        seq.process_status_update(&json!({"toolhead": {"homed_axes": ""}}));
        seq.process_status_update(&json!({"toolhead": {"homed_axes": "xy"}}));
        assert_eq!(seq.state(), SequencerState::Waiting);
        seq.process_status_update(&json!({"toolhead": {"homed_axes": "xyz"}}));
        settle().await;

        assert_eq!(seq.state(), SequencerState::Completed);
        assert_eq!(cap.complete.lock().as_slice(), [(true, String::new())]);
        let progress = cap.progress.lock();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0], (1, 1, "Homing".to_string()));
        assert_eq!(progress[1], (1, 1, String::new()));
    }

    #[tokio::test]
    async fn test_heat_then_print_sequence() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink.clone());
        seq.add(
            Operation::new(
                OperationType::PreheatExtruder,
                json!({"target": 210.0}),
                "Heating Extruder",
            )
            .with_timeout(Duration::from_secs(60)),
        )
        .unwrap();
        seq.add(Operation::new(
            OperationType::StartPrint,
            json!({"filename": "cube.gcode"}),
            "Starting Print",
        ))
        .unwrap();

        let cap = start_captured(&seq);
        settle().await;
        assert_eq!(
            sink.gcode.lock().as_slice(),
            ["SET_HEATER_TEMPERATURE HEATER=extruder TARGET=210"]
        );

        for temp in [25.0, 100.0, 180.0] {
            seq.process_status_update(&json!({"extruder": {"temperature": temp}}));
        }
        assert_eq!(seq.state(), SequencerState::Waiting);
        // Near-target must hold on two consecutive deltas.
        seq.process_status_update(&json!({"extruder": {"temperature": 209.0}}));
        assert_eq!(seq.state(), SequencerState::Waiting);
        seq.process_status_update(&json!({"extruder": {"temperature": 210.0}}));
        settle().await;

        assert_eq!(sink.prints.lock().as_slice(), ["cube.gcode"]);
        seq.process_status_update(&json!({"print_stats": {"state": "printing"}}));
        settle().await;

        assert_eq!(seq.state(), SequencerState::Completed);
        assert_eq!(cap.complete.lock().as_slice(), [(true, String::new())]);
        assert_eq!(cap.progress.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_chamber_soak_waits_for_chamber_temp() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink.clone());
        seq.add(Operation::new(
            OperationType::ChamberSoak,
            json!({"target": 45.0}),
            "Chamber Soak",
        ))
        .unwrap();

        let cap = start_captured(&seq);
        settle().await;
        assert_eq!(
            sink.gcode.lock().as_slice(),
            ["SET_HEATER_TEMPERATURE HEATER=chamber TARGET=45"]
        );

        seq.process_status_update(&json!({"heater_generic chamber": {"temperature": 30.0}}));
        seq.process_status_update(&json!({"heater_generic chamber": {"temperature": 44.5}}));
        assert_eq!(seq.state(), SequencerState::Waiting);
        seq.process_status_update(&json!({"heater_generic chamber": {"temperature": 45.1}}));
        settle().await;

        assert_eq!(seq.state(), SequencerState::Completed);
        assert_eq!(cap.complete.lock().as_slice(), [(true, String::new())]);
    }

    #[tokio::test]
    async fn test_load_mesh_profile_waits_for_active_profile() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink.clone());
        seq.add(Operation::new(
            OperationType::LoadMeshProfile,
            json!({"profile": "textured-pei"}),
            "Loading Mesh",
        ))
        .unwrap();

        let cap = start_captured(&seq);
        settle().await;
        assert_eq!(
            sink.gcode.lock().as_slice(),
            ["BED_MESH_PROFILE LOAD=textured-pei"]
        );

        // A different active profile does not satisfy the wait.
        seq.process_status_update(&json!({"bed_mesh": {"profile_name": "default"}}));
        assert_eq!(seq.state(), SequencerState::Waiting);
        seq.process_status_update(&json!({"bed_mesh": {"profile_name": "textured-pei"}}));
        settle().await;

        assert_eq!(seq.state(), SequencerState::Completed);
        assert_eq!(cap.complete.lock().as_slice(), [(true, String::new())]);
    }

    #[tokio::test]
    async fn test_load_mesh_profile_requires_name() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink);
        seq.add(Operation::new(
            OperationType::LoadMeshProfile,
            json!({}),
            "Loading Mesh",
        ))
        .unwrap();

        let cap = start_captured(&seq);
        settle().await;

        assert_eq!(seq.state(), SequencerState::Failed);
        let complete = cap.complete.lock();
        assert_eq!(complete.len(), 1);
        assert!(!complete[0].0);
    }

    #[tokio::test]
    async fn test_operation_timeout_fails_sequence() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink);
        seq.add(
            Operation::new(OperationType::Home, json!({}), "Homing")
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let cap = start_captured(&seq);
        sleep(Duration::from_millis(150)).await;

        assert_eq!(seq.state(), SequencerState::Failed);
        let complete = cap.complete.lock();
        assert_eq!(complete.len(), 1);
        assert!(!complete[0].0);
        assert!(complete[0].1.contains("timed out"));
    }

    #[tokio::test]
    async fn test_double_cancel_escalates_once() {
        tokio::time::pause();
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink.clone());
        seq.add(Operation::new(OperationType::Home, json!({}), "Homing"))
            .unwrap();
        let cap = start_captured(&seq);
        tokio::time::advance(Duration::from_millis(20)).await;

        assert!(seq.cancel());
        assert_eq!(seq.state(), SequencerState::Cancelling);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(seq.cancel());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!seq.cancel());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(sink.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(sink.estops.load(Ordering::SeqCst), 1);

        // Host settles; sequence goes terminal.
        seq.process_status_update(&json!({"print_stats": {"state": "standby"}}));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(seq.state(), SequencerState::Cancelled);
        assert_eq!(cap.complete.lock().len(), 1);

        // Window long past, but the sequence is terminal.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!seq.cancel());
    }

    #[tokio::test]
    async fn test_queue_locked_while_running() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink);
        seq.add(Operation::new(OperationType::Home, json!({}), "Homing"))
            .unwrap();
        let _cap = start_captured(&seq);
        settle().await;

        let err = seq
            .add(Operation::new(OperationType::ZTilt, json!({}), "Z-Tilt"))
            .unwrap_err();
        assert_eq!(err.label(), "WRONG_STATE");
        assert_eq!(seq.clear().unwrap_err().label(), "WRONG_STATE");
    }

    #[tokio::test]
    async fn test_macro_operation_completes_on_reply() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink.clone());
        seq.add(Operation::new(
            OperationType::NozzleClean,
            json!({"macro": "CLEAN_NOZZLE"}),
            "Nozzle Clean",
        ))
        .unwrap();
        let cap = start_captured(&seq);
        settle().await;

        assert_eq!(seq.state(), SequencerState::Completed);
        assert_eq!(sink.gcode.lock().as_slice(), ["CLEAN_NOZZLE"]);
        assert_eq!(cap.complete.lock().as_slice(), [(true, String::new())]);
    }

    #[tokio::test]
    async fn test_host_shutdown_fails_sequence() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink);
        seq.add(Operation::new(OperationType::Home, json!({}), "Homing"))
            .unwrap();
        let cap = start_captured(&seq);
        settle().await;

        seq.notify_host_shutdown("MCU timeout");
        settle().await;

        assert_eq!(seq.state(), SequencerState::Failed);
        let complete = cap.complete.lock();
        assert!(complete[0].1.contains("host shutdown"));
    }

    #[tokio::test]
    async fn test_start_rejected_when_empty_or_running() {
        let sink = Arc::new(FakeSink::default());
        let seq = OperationSequencer::new(sink);
        assert!(!seq.start(Arc::new(|_, _, _| {}), Arc::new(|_, _| {})));

        seq.add(Operation::new(OperationType::Home, json!({}), "Homing"))
            .unwrap();
        let _cap = start_captured(&seq);
        assert!(!seq.start(Arc::new(|_, _, _| {}), Arc::new(|_, _| {})));
    }
}
