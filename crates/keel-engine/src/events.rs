use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;

use keel_urn::Urn;

use crate::step::StepOp;

/// Success counts by step operation.
pub type StepOpCounts = BTreeMap<StepOp, usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagSeverity {
    Info,
    Warning,
    Error,
}

/// Events the engine emits for display collaborators. The engine never
/// reads these back; a slow or absent consumer must not stall a
/// deployment.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The deployment is about to start.
    Prelude {
        mode: crate::options::DeploymentMode,
        resources_in_snapshot: usize,
    },
    /// A step is about to execute.
    ResourcePre { op: StepOp, urn: Urn },
    /// A step completed and produced (or carried forward) outputs.
    ResourceOutputs { op: StepOp, urn: Urn },
    /// A step failed.
    ResourceFailed { urn: Urn, message: String },
    Diag {
        severity: DiagSeverity,
        urn: Option<Urn>,
        message: String,
    },
    /// A policy collaborator's verdict on a resource. The engine defines
    /// the vocabulary; policy evaluation itself lives outside the core.
    Policy {
        urn: Option<Urn>,
        policy: String,
        message: String,
    },
    /// A provider host started downloading a plugin.
    PluginDownload { package: String },
    /// A provider host installed a plugin.
    PluginInstall { package: String },
    /// The deployment finished.
    Summary {
        counts: StepOpCounts,
        duration: Duration,
    },
}

/// The sending half of the engine's event stream. Sends never block and
/// never fail the engine: once the consumer goes away events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
