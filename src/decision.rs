use std::sync::Arc;
use tracing::warn;

use crate::metrics;
use crate::model::SignalStatus;
use crate::outcome::{ProcessResult, StepResult, ValidationPhase};
use crate::persistence::event_log::EventLog;
use crate::persistence::signal_store::SignalStore;
use crate::pipeline::SignalContext;

/// Turns a failed step into the terminal bookkeeping: status flip, audit
/// event, rejection result. Status/event writes are best-effort — a failing
/// write must never mask the original rejection.
pub struct Decision {
    signals: Arc<dyn SignalStore>,
    events: Arc<dyn EventLog>,
}

impl Decision {
    pub fn new(signals: Arc<dyn SignalStore>, events: Arc<dyn EventLog>) -> Self {
        Self { signals, events }
    }

    /// None means the step passed and the pipeline continues.
    pub fn handle(
        &self,
        ctx: &SignalContext,
        step: &StepResult,
        phase: ValidationPhase,
    ) -> Option<ProcessResult> {
        let rejection = step.rejection()?;
        let signal_id = ctx.saved_signal_id;

        if let Err(e) = self.signals.update_status(signal_id, SignalStatus::Rejected) {
            warn!(signal_id = %signal_id, error = %e, "status update to REJECTED failed");
        }

        if let Err(e) = self.events.record_failed(
            signal_id,
            phase,
            rejection.code,
            &rejection.message,
            &rejection.details,
        ) {
            warn!(signal_id = %signal_id, phase = ?phase, error = %e, "event recording failed");
        }

        warn!(
            signal_id = %signal_id, phase = ?phase, code = ?rejection.code,
            msg = %rejection.message, "signal rejected"
        );
        metrics::inc_rejected();
        Some(ProcessResult::rejected(
            Some(signal_id),
            vec![rejection.clone()],
        ))
    }
}
