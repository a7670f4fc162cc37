//! Per-invocation state machine for the streaming endpoints.
//!
//! `Created → Streaming → (ToolCallPending)* → Terminated{Success | Cancelled | Failed}`
//!
//! The same machine runs on both sides of a channel: the server drives it
//! before emitting each packet, the client feeds it every packet it receives
//! to keep a local projection (reconstructed text, last known phase).

use std::fmt;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{PredictionFragment, ToolCallRequest};

/// What a to-client packet means to the session, independent of its payload layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEvent<'a> {
    Fragment(&'a PredictionFragment),
    PromptProcessingProgress(f64),
    ToolCallGenerationStart,
    ToolCallGenerationEnd(&'a ToolCallRequest),
    ToolCallGenerationFailed,
    Success,
}

impl SessionEvent<'_> {
    pub fn packet_type(&self) -> &'static str {
        match self {
            SessionEvent::Fragment(_) => "fragment",
            SessionEvent::PromptProcessingProgress(_) => "promptProcessingProgress",
            SessionEvent::ToolCallGenerationStart => "toolCallGenerationStart",
            SessionEvent::ToolCallGenerationEnd(_) => "toolCallGenerationEnd",
            SessionEvent::ToolCallGenerationFailed => "toolCallGenerationFailed",
            SessionEvent::Success => "success",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Success)
    }
}

/// Server→client packet union of a channel endpoint.
pub trait SessionPacket: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn event(&self) -> SessionEvent<'_>;
}

/// Client→server packet union of a channel endpoint.
pub trait ServerBoundPacket: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn cancel() -> Self;
    fn is_cancel(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Cancelled,
    Failed,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Success => f.write_str("success"),
            SessionOutcome::Cancelled => f.write_str("cancelled"),
            SessionOutcome::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Streaming,
    ToolCallPending,
    Terminated(SessionOutcome),
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Terminated(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SequencingViolation {
    #[error("{packet} sent after the session terminated ({outcome})")]
    PacketAfterTerminal {
        packet: &'static str,
        outcome: SessionOutcome,
    },

    #[error("{packet} without an open toolCallGenerationStart")]
    UnmatchedToolCallEnd { packet: &'static str },

    #[error("toolCallGenerationStart while a tool call is already pending")]
    OverlappingToolCall,

    #[error("success while a tool call is still pending")]
    TerminalDuringToolCall,

    #[error("prompt processing progress {0} is outside 0.0..=1.0")]
    ProgressOutOfRange(f64),

    #[error("prompt processing progress went from {previous} back to {current}")]
    ProgressDecreased { previous: f64, current: f64 },

    #[error("channel closed without a terminal packet")]
    MissingTerminal,
}

#[derive(Debug, Clone)]
pub struct PhaseTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub at: Instant,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PredictionSession {
    id: Uuid,
    channel_id: u64,
    phase: SessionPhase,
    fragments: Vec<PredictionFragment>,
    tool_call_requests: Vec<ToolCallRequest>,
    tool_call_cycles: usize,
    last_progress: Option<f64>,
    cancel_requested: bool,
    failure: Option<String>,
    transitions: Vec<PhaseTransition>,
}

impl PredictionSession {
    pub fn new(channel_id: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            phase: SessionPhase::Created,
            fragments: Vec::new(),
            tool_call_requests: Vec::new(),
            tool_call_cycles: 0,
            last_progress: None,
            cancel_requested: false,
            failure: None,
            transitions: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self.phase {
            SessionPhase::Terminated(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn fragments(&self) -> &[PredictionFragment] {
        &self.fragments
    }

    /// Text reconstructed from all fragments, in emission order.
    pub fn text(&self) -> String {
        self.fragments.iter().map(|f| f.content.as_str()).collect()
    }

    pub fn tool_call_requests(&self) -> &[ToolCallRequest] {
        &self.tool_call_requests
    }

    /// Number of completed tool-call cycles, failed ones included.
    pub fn tool_call_cycles(&self) -> usize {
        self.tool_call_cycles
    }

    pub fn last_progress(&self) -> Option<f64> {
        self.last_progress
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    /// Checks `event` against the current phase and applies it.
    /// Rejected events leave the session untouched.
    pub fn observe(&mut self, event: SessionEvent<'_>) -> Result<(), SequencingViolation> {
        if let SessionPhase::Terminated(outcome) = self.phase {
            return Err(SequencingViolation::PacketAfterTerminal {
                packet: event.packet_type(),
                outcome,
            });
        }

        match event {
            SessionEvent::Fragment(fragment) => {
                self.fragments.push(fragment.clone());
                self.enter_streaming();
            }
            SessionEvent::PromptProcessingProgress(progress) => {
                if !(0.0..=1.0).contains(&progress) {
                    return Err(SequencingViolation::ProgressOutOfRange(progress));
                }
                if let Some(previous) = self.last_progress {
                    if progress < previous {
                        return Err(SequencingViolation::ProgressDecreased {
                            previous,
                            current: progress,
                        });
                    }
                }
                self.last_progress = Some(progress);
                self.enter_streaming();
            }
            SessionEvent::ToolCallGenerationStart => {
                if self.phase == SessionPhase::ToolCallPending {
                    return Err(SequencingViolation::OverlappingToolCall);
                }
                self.transition_to(SessionPhase::ToolCallPending, None);
            }
            SessionEvent::ToolCallGenerationEnd(request) => {
                self.close_tool_call(event.packet_type())?;
                self.tool_call_requests.push(request.clone());
            }
            SessionEvent::ToolCallGenerationFailed => {
                self.close_tool_call(event.packet_type())?;
            }
            SessionEvent::Success => {
                if self.phase == SessionPhase::ToolCallPending {
                    return Err(SequencingViolation::TerminalDuringToolCall);
                }
                self.transition_to(SessionPhase::Terminated(SessionOutcome::Success), None);
            }
        }
        Ok(())
    }

    /// Marks the session cancelled. Returns `false` when it had already
    /// terminated, in which case nothing changes.
    pub fn cancel(&mut self) -> bool {
        self.cancel_requested = true;
        if self.is_terminal() {
            return false;
        }
        self.transition_to(
            SessionPhase::Terminated(SessionOutcome::Cancelled),
            Some("cancel observed".to_string()),
        );
        true
    }

    /// Records that a cancel was sent without terminating; in-flight packets
    /// are still applied until the channel closes.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    /// Aborts the session with a channel-level failure. Returns `false` when
    /// it had already terminated.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let reason = reason.into();
        self.failure = Some(reason.clone());
        self.transition_to(SessionPhase::Terminated(SessionOutcome::Failed), Some(reason));
        true
    }

    /// Called when the channel closes cleanly. A session that never saw a
    /// terminal packet is cancelled if a cancel was sent, otherwise the close
    /// is a sequencing violation.
    pub fn close(&mut self) -> Result<SessionOutcome, SequencingViolation> {
        if let Some(outcome) = self.outcome() {
            return Ok(outcome);
        }
        if self.cancel_requested {
            self.cancel();
            return Ok(SessionOutcome::Cancelled);
        }
        self.fail(SequencingViolation::MissingTerminal.to_string());
        Err(SequencingViolation::MissingTerminal)
    }

    fn enter_streaming(&mut self) {
        if self.phase == SessionPhase::Created {
            self.transition_to(SessionPhase::Streaming, None);
        }
    }

    fn close_tool_call(&mut self, packet: &'static str) -> Result<(), SequencingViolation> {
        if self.phase != SessionPhase::ToolCallPending {
            return Err(SequencingViolation::UnmatchedToolCallEnd { packet });
        }
        self.tool_call_cycles += 1;
        self.transition_to(SessionPhase::Streaming, None);
        Ok(())
    }

    fn transition_to(&mut self, to: SessionPhase, reason: Option<String>) {
        debug_assert!(
            is_valid_transition(self.phase, to),
            "invalid transition {:?} -> {:?}",
            self.phase,
            to
        );
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            at: Instant::now(),
            reason,
        });
        self.phase = to;
    }
}

fn is_valid_transition(from: SessionPhase, to: SessionPhase) -> bool {
    use SessionPhase::*;

    match (from, to) {
        (Created, Streaming) => true,
        (Created, ToolCallPending) => true,
        (Streaming, ToolCallPending) => true,
        (ToolCallPending, Streaming) => true,
        (Created | Streaming, Terminated(SessionOutcome::Success)) => true,
        (Terminated(_), _) => false,
        (_, Terminated(SessionOutcome::Cancelled | SessionOutcome::Failed)) => true,
        _ => false,
    }
}
