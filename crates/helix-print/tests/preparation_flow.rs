//! End-to-end preparation flow: assemble the queue, run it, and drive
//! completion through status updates the way the host would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::sleep;

use helix_core::error::Result;
use helix_core::{Capabilities, ModifierConfig};
use helix_gcode::{FileModifier, HostFileApi};
use helix_print::{
    CommandSink, OperationSequencer, PrepOptions, PrintPreparation, SequencerState,
};

struct MemoryHost {
    files: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl HostFileApi for MemoryHost {
    async fn download_file(&self, path: &str) -> Result<String> {
        self.files.lock().get(path).cloned().ok_or_else(|| {
            helix_core::FileError::NotFound {
                path: path.to_string(),
            }
            .into()
        })
    }
    async fn upload_file(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }
    async fn delete_file(&self, path: &str) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }
    async fn patch_job_history(&self, _job_id: &str, _filename: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    gcode: Mutex<Vec<String>>,
    prints: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn run_gcode(&self, script: &str) -> Result<()> {
        self.gcode.lock().push(script.to_string());
        Ok(())
    }
    async fn start_print(&self, filename: &str) -> Result<()> {
        self.prints.lock().push(filename.to_string());
        Ok(())
    }
    async fn cancel_print(&self) -> Result<()> {
        Ok(())
    }
    async fn emergency_stop(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_prepare_run_and_complete_via_status_updates() {
    let mut files = HashMap::new();
    files.insert(
        "gcodes/benchy.gcode".to_string(),
        "G1 Z0.2 E0.1\nG1 X10 E0.5\n".to_string(),
    );
    let host = Arc::new(MemoryHost {
        files: Mutex::new(files),
    });
    let sink = Arc::new(RecordingSink::default());

    let sequencer = OperationSequencer::new(sink.clone());
    let modifier = FileModifier::new(host.clone(), ModifierConfig::default());
    let preparation = PrintPreparation::new(sequencer.clone(), host, modifier);

    // Only homing enabled; nothing embedded in the file.
    let options = PrepOptions {
        quad_gantry_level: false,
        z_tilt: false,
        bed_mesh: false,
        ..Default::default()
    };

    let done: Arc<Mutex<Option<(bool, String)>>> = Arc::new(Mutex::new(None));
    let done_sink = done.clone();
    let plan = preparation
        .prepare_and_start(
            "gcodes/benchy.gcode",
            &options,
            &Capabilities::default(),
            Arc::new(|_, _, _| {}),
            Arc::new(move |ok, msg| {
                *done_sink.lock() = Some((ok, msg.to_string()));
            }),
        )
        .await
        .unwrap();
    assert_eq!(plan.queued, vec!["Homing", "Starting Print"]);
    assert_eq!(plan.print_path, "gcodes/benchy.gcode");

    // Periodic status updates stand in for the host's notifications.
    let feeder = sequencer.clone();
    let feed = tokio::spawn(async move {
        for _ in 0..80 {
            feeder.process_status_update(&json!({
                "toolhead": {"homed_axes": "xyz"},
                "print_stats": {"state": "printing"}
            }));
            sleep(Duration::from_millis(25)).await;
        }
    });

    for _ in 0..100 {
        if done.lock().is_some() {
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    feed.abort();

    let (ok, msg) = done.lock().clone().expect("sequence never completed");
    assert!(ok, "sequence failed: {msg}");
    assert_eq!(sequencer.state(), SequencerState::Completed);
    assert_eq!(sink.gcode.lock().as_slice(), ["G28 X Y Z"]);
    assert_eq!(
        sink.prints.lock().as_slice(),
        ["gcodes/benchy.gcode".to_string()]
    );
}
