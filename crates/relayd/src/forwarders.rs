//! Downstream handlers wired into the relay process.
//!
//! Both forwarders write to dedicated tracing targets (`audit`, `ingestion`)
//! so a log shipper can route them to the SIEM or to the ingestion runner.

use async_trait::async_trait;
use steward_infra::families::{AuditEvent, IngestionRequest};
use steward_outbox::{DispatchError, DispatchHandler};
use tracing::info;

/// Forwards audit events from the `file_audit` and `draft_audit` queues.
#[derive(Debug, Clone)]
pub struct AuditLogForwarder {
    queue: &'static str,
}

impl AuditLogForwarder {
    pub fn new(queue: &'static str) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DispatchHandler for AuditLogForwarder {
    type Payload = AuditEvent;

    async fn dispatch(&self, job_type: &str, event: AuditEvent) -> Result<(), DispatchError> {
        if event.actor.trim().is_empty() {
            return Err(DispatchError::permanent("audit event has no actor"));
        }
        let details = serde_json::to_string(&event.details)
            .map_err(|e| DispatchError::permanent(format!("details not serializable: {e}")))?;

        info!(
            target: "audit",
            queue = self.queue,
            job_type,
            action = %event.action,
            actor = %event.actor,
            resource_id = %event.resource_id,
            occurred_at = %event.occurred_at,
            details = %details,
            "audit event"
        );
        Ok(())
    }
}

/// Hands ingestion requests to the ingestion runner's log-fed intake.
#[derive(Debug, Clone, Default)]
pub struct IngestionForwarder;

#[async_trait]
impl DispatchHandler for IngestionForwarder {
    type Payload = IngestionRequest;

    async fn dispatch(
        &self,
        job_type: &str,
        request: IngestionRequest,
    ) -> Result<(), DispatchError> {
        if request.file_path.trim().is_empty() {
            return Err(DispatchError::permanent("ingestion request has no file path"));
        }
        info!(
            target: "ingestion",
            job_type,
            source_id = %request.source_id,
            file_path = %request.file_path,
            requested_by = ?request.requested_by,
            "ingestion requested"
        );
        Ok(())
    }
}
