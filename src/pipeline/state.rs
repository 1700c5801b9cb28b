//! Playback state management

use crate::error::PipelineError;

/// State to return to once a seek or rate change has settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState {
    Playing,
    Paused,
}

impl ResumeState {
    pub fn into_state(self) -> PlaybackState {
        match self {
            ResumeState::Playing => PlaybackState::Playing,
            ResumeState::Paused => PlaybackState::Paused,
        }
    }
}

/// Fault that moved the controller to [`PlaybackState::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceExhausted,
    StallTimeout,
    TunnelViolation,
}

impl ErrorKind {
    /// Classify an error, `None` for the local ones that never escalate
    pub fn of(error: &PipelineError) -> Option<ErrorKind> {
        match error {
            PipelineError::ResourceExhausted(_) => Some(ErrorKind::ResourceExhausted),
            PipelineError::StallTimeout { .. } => Some(ErrorKind::StallTimeout),
            PipelineError::TunnelViolation(_) => Some(ErrorKind::TunnelViolation),
            _ => None,
        }
    }
}

/// Playback state machine
///
/// Represents the current state of a playback session. Every command checks
/// its transition against [`can_transition_to`](Self::can_transition_to)
/// before touching the clock or the pipelines, so combinations such as
/// stepping while playing are rejected instead of half-applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No pipelines, no clock
    Closed,

    /// Pipelines built, waiting for the first decoded frame
    Opening,

    /// Clock running, units presented as they fall due
    Playing,

    /// Clock frozen, pipelines keep their queued buffers
    Paused,

    /// Feed stopped while both pipelines flush and the clock jumps
    Seeking {
        /// State held before the seek began
        resume: ResumeState,
    },

    /// End of stream reached with looping disabled
    Finished,

    /// Unrecoverable pipeline fault, only `close` leaves it
    Error { kind: ErrorKind },
}

impl PlaybackState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PlaybackState) -> bool {
        use PlaybackState::*;

        match (self, target) {
            // Close always wins
            (_, Closed) => true,

            // Error is absorbing
            (Error { .. }, _) => false,
            (_, Error { .. }) => !matches!(self, Closed),

            // From Closed
            (Closed, Opening) => true,

            // From Opening, a pause requested before the first frame is honored
            (Opening, Playing) => true,
            (Opening, Paused) => true,

            // From Playing
            (Playing, Paused) => true,
            (Playing, Seeking { resume }) => *resume == ResumeState::Playing,
            (Playing, Finished) => true,

            // From Paused
            (Paused, Playing) => true,
            (Paused, Seeking { resume }) => *resume == ResumeState::Paused,
            (Paused, Finished) => true,

            // Seeking after the end resumes paused
            (Finished, Seeking { resume }) => *resume == ResumeState::Paused,

            // Seeking settles into the state it came from
            (Seeking { resume }, Playing) => *resume == ResumeState::Playing,
            (Seeking { resume }, Paused) => *resume == ResumeState::Paused,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PlaybackState::Closed => "Closed",
            PlaybackState::Opening => "Opening",
            PlaybackState::Playing => "Playing",
            PlaybackState::Paused => "Paused",
            PlaybackState::Seeking { .. } => "Seeking",
            PlaybackState::Finished => "Finished",
            PlaybackState::Error { .. } => "Error",
        }
    }

    /// Whether pipelines exist (anything but Closed)
    pub fn is_open(&self) -> bool {
        !matches!(self, PlaybackState::Closed)
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PlaybackState::Paused)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, PlaybackState::Finished)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PlaybackState::Error { .. })
    }

    /// Where a seek started from this state should resume
    pub fn seek_resume(&self) -> Option<ResumeState> {
        match self {
            PlaybackState::Playing => Some(ResumeState::Playing),
            PlaybackState::Paused | PlaybackState::Finished => Some(ResumeState::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Error { kind } => write!(f, "Error ({:?})", kind),
            other => write!(f, "{}", other.description()),
        }
    }
}
