//! Top-level wiring: connects the transport, state store, AMS bridge,
//! and print workflow into one running core.

use std::sync::Arc;

use tracing::{info, warn};

use helix_ams::{ams_bridge, create_backend, AmsBackend, MacroSink, MockAmsBackend};
use helix_core::error::Result;
use helix_core::{state_store, AmsType, PrinterState, RuntimeConfig};
use helix_gcode::FileModifier;
use helix_print::{OperationSequencer, PrintPreparation};
use helix_transport::{
    run_discovery, LifecycleCallback, RpcClient, NOTIFY_KLIPPY_SHUTDOWN,
};

use crate::host::HostApi;

/// Default gate count for the simulated AMS
const MOCK_GATE_COUNT: i32 = 4;

/// The assembled printer control core
///
/// Owns the client and the workflow layers; everything downstream of
/// the socket observes the global cell store.
pub struct PrinterCore {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    config: RuntimeConfig,
    client: Arc<RpcClient>,
    host: Arc<HostApi>,
    printer_state: Arc<PrinterState>,
    sequencer: OperationSequencer,
    preparation: PrintPreparation,
}

impl PrinterCore {
    /// Build the core from runtime configuration
    ///
    /// Registers every cell up front so UI observers can subscribe
    /// before the first connection attempt.
    pub fn new(config: RuntimeConfig) -> Self {
        let client = Arc::new(RpcClient::new(config.transport.clone()));
        let host = Arc::new(HostApi::new(client.clone()));
        let sequencer = OperationSequencer::new(host.clone());
        let modifier = FileModifier::new(host.clone(), config.modifier.clone());
        let preparation = PrintPreparation::new(sequencer.clone(), host.clone(), modifier);

        let printer_state = Arc::new(PrinterState::new());
        printer_state.init_cells(state_store());
        printer_state.set_led_on_threshold(config.led_on_threshold);
        ams_bridge().init_cells();

        Self {
            inner: Arc::new(CoreInner {
                config,
                client,
                host,
                printer_state,
                sequencer,
                preparation,
            }),
        }
    }

    /// Open the host connection and start the handshake
    ///
    /// Returns once the connection task is spawned; discovery runs in
    /// the background after every (re)connect.
    pub fn connect(&self, url: &str) -> Result<()> {
        let inner = self.inner.clone();
        self.inner.client.register_status_handler(Arc::new({
            let inner = inner.clone();
            move |status, _eventtime| {
                inner.printer_state.apply_status(state_store(), status);
                inner.sequencer.process_status_update(status);
                ams_bridge().process_status_update(status);
            }
        }));
        self.inner.client.register_notification(
            NOTIFY_KLIPPY_SHUTDOWN,
            "core",
            Arc::new({
                let sequencer = inner.sequencer.clone();
                move |_| sequencer.notify_host_shutdown("Klippy reported shutdown")
            }),
        );

        let on_connected: LifecycleCallback = Arc::new({
            let inner = inner.clone();
            move || {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.handshake().await {
                        warn!("Host handshake failed: {e}");
                    }
                });
            }
        });
        let on_disconnected: LifecycleCallback = Arc::new({
            let inner = inner.clone();
            move || inner.printer_state.clear()
        });
        self.inner
            .client
            .connect(url, Some(on_connected), Some(on_disconnected))
    }

    /// Close the connection and stop reconnecting
    pub fn disconnect(&self) {
        self.inner.client.disconnect();
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.inner.client
    }

    pub fn host(&self) -> &Arc<HostApi> {
        &self.inner.host
    }

    pub fn printer_state(&self) -> &Arc<PrinterState> {
        &self.inner.printer_state
    }

    pub fn sequencer(&self) -> &OperationSequencer {
        &self.inner.sequencer
    }

    pub fn preparation(&self) -> &PrintPreparation {
        &self.inner.preparation
    }
}

impl CoreInner {
    /// Post-connect discovery and wiring, re-run on every reconnect
    async fn handshake(self: &Arc<Self>) -> Result<()> {
        let discovery = run_discovery(&self.client).await?;

        let mut caps = discovery.capabilities;
        caps.set_overrides(self.config.capability_overrides(&discovery.hostname));
        caps.publish(state_store());

        self.printer_state.set_selection(discovery.selection);
        self.printer_state
            .apply_status(state_store(), &discovery.initial_status);
        self.sequencer
            .process_status_update(&discovery.initial_status);

        let sink: Arc<dyn MacroSink> = self.host.clone();
        match select_ams_backend(self.config.ams_mock_mode, caps.ams_type, sink) {
            Some(backend) => ams_bridge().set_backend(backend).await?,
            None => ams_bridge().clear_backend().await?,
        }

        info!(
            hostname = %discovery.hostname,
            klippy = %discovery.klippy_state,
            ams = ?caps.ams_type,
            "Host handshake complete"
        );
        Ok(())
    }
}

/// Pick the AMS backend for this session
///
/// Mock mode wins over hardware detection so the simulator can be
/// exercised on printers that have a real unit attached.
fn select_ams_backend(
    mock_mode: bool,
    ams_type: AmsType,
    sink: Arc<dyn MacroSink>,
) -> Option<Arc<dyn AmsBackend>> {
    if mock_mode {
        return Some(Arc::new(MockAmsBackend::new(MOCK_GATE_COUNT)));
    }
    create_backend(ams_type, sink)
}
