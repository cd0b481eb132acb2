use crate::model::{Intent, PendingCommand, RecordingState};
use crate::protocol::{
    RequestResponse, RequestType, STATUS_OUTPUT_NOT_RUNNING, STATUS_OUTPUT_RUNNING,
};
use crate::session::CommandRejected;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Outbound half of a connection, as seen by the correlator.
pub trait RequestSink {
    fn send_request(
        &mut self,
        request_type: RequestType,
        correlation_id: &str,
    ) -> Result<(), CommandRejected>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Sent,
    /// Recording state already matches the intent.
    AlreadySatisfied,
    /// A command with the same intent is still awaiting its response.
    AlreadyPending,
    /// A command with the other intent is still awaiting its response.
    Busy(Intent),
    Rejected(CommandRejected),
}

/// Tracks outstanding commands and owns the confirmed recording state.
#[derive(Debug)]
pub struct Correlator {
    recording: RecordingState,
    pending: Option<PendingCommand>,
    status_probe: Option<String>,
    command_timeout: Duration,
}

impl Correlator {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            recording: RecordingState::Idle,
            pending: None,
            status_probe: None,
            command_timeout,
        }
    }

    pub fn recording(&self) -> RecordingState {
        self.recording
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    pub fn request_start<S: RequestSink>(&mut self, sink: &mut S, now: Instant) -> CommandOutcome {
        self.request(Intent::Start, sink, now)
    }

    pub fn request_stop<S: RequestSink>(&mut self, sink: &mut S, now: Instant) -> CommandOutcome {
        self.request(Intent::Stop, sink, now)
    }

    fn request<S: RequestSink>(
        &mut self,
        intent: Intent,
        sink: &mut S,
        now: Instant,
    ) -> CommandOutcome {
        self.expire_stale(now);

        if let Some(pending) = &self.pending {
            return if pending.intent == intent {
                CommandOutcome::AlreadyPending
            } else {
                CommandOutcome::Busy(pending.intent)
            };
        }
        if self.recording == intent.target() {
            return CommandOutcome::AlreadySatisfied;
        }

        let request_type = match intent {
            Intent::Start => RequestType::StartRecording,
            Intent::Stop => RequestType::StopRecording,
        };
        let correlation_id = intent.correlation_id();
        if let Err(err) = sink.send_request(request_type, correlation_id) {
            return CommandOutcome::Rejected(err);
        }
        self.pending = Some(PendingCommand {
            correlation_id: correlation_id.to_string(),
            intent,
            issued_at: now,
        });
        CommandOutcome::Sent
    }

    /// Asks the server for the real recording state. The answer is applied
    /// only while no state-changing command is outstanding.
    pub fn probe_status<S: RequestSink>(&mut self, sink: &mut S) -> CommandOutcome {
        let probe_id = format!("status-{}", Uuid::new_v4());
        if let Err(err) = sink.send_request(RequestType::GetRecordStatus, &probe_id) {
            return CommandOutcome::Rejected(err);
        }
        self.status_probe = Some(probe_id);
        CommandOutcome::Sent
    }

    /// Applies a confirmed response. Returns the new recording state when it changed.
    pub fn on_response(&mut self, response: &RequestResponse) -> Option<RecordingState> {
        if self.status_probe.as_deref() == Some(response.request_id.as_str()) {
            self.status_probe = None;
            return self.apply_status_probe(response);
        }

        let Some(intent) = Intent::from_correlation_id(&response.request_id) else {
            tracing::debug!(request_id = %response.request_id, "ignoring response to untracked request");
            return None;
        };

        match self.pending.as_ref() {
            Some(pending) if pending.intent == intent => {
                self.pending = None;
            }
            _ => {
                tracing::debug!(intent = %intent, "response arrived without a pending command");
            }
        }

        let confirmed = response.succeeded()
            || matches!(
                (intent, response.status_code()),
                (Intent::Start, Some(STATUS_OUTPUT_RUNNING))
                    | (Intent::Stop, Some(STATUS_OUTPUT_NOT_RUNNING))
            );
        if !confirmed {
            let comment = response
                .request_status
                .as_ref()
                .and_then(|s| s.comment.clone())
                .unwrap_or_default();
            tracing::warn!(
                intent = %intent,
                code = ?response.status_code(),
                comment = %comment,
                "recording command failed on the server"
            );
            return None;
        }

        self.set_recording(intent.target())
    }

    /// Drops the outstanding command because its response can no longer arrive.
    pub fn discard_pending(&mut self, reason: &str) {
        self.status_probe = None;
        if let Some(pending) = self.pending.take() {
            tracing::warn!(
                intent = %pending.intent,
                request_id = %pending.correlation_id,
                age_ms = pending.issued_at.elapsed().as_millis() as u64,
                reason,
                "discarding unacknowledged recording command; recording state left unchanged"
            );
        }
    }

    /// Forgets everything learned from a previous connection.
    pub fn reset(&mut self) {
        self.pending = None;
        self.status_probe = None;
        self.recording = RecordingState::Idle;
    }

    fn apply_status_probe(&mut self, response: &RequestResponse) -> Option<RecordingState> {
        if !response.succeeded() {
            tracing::warn!(code = ?response.status_code(), "record status query failed");
            return None;
        }
        if self.pending.is_some() {
            tracing::debug!("record status ignored while a command is pending");
            return None;
        }
        let active = response.output_active()?;
        let state = if active {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        };
        self.set_recording(state)
    }

    fn expire_stale(&mut self, now: Instant) {
        let stale = self
            .pending
            .as_ref()
            .is_some_and(|p| now.saturating_duration_since(p.issued_at) >= self.command_timeout);
        if stale {
            self.discard_pending("no response within command timeout");
        }
    }

    fn set_recording(&mut self, state: RecordingState) -> Option<RecordingState> {
        if self.recording == state {
            return None;
        }
        self.recording = state;
        Some(state)
    }
}
