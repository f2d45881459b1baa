//! The four-phase pipeline state machine.
//!
//! Each phase walks pending → running → (success | error) and never leaves
//! a terminal status. The board computes which transitions a tool lifecycle
//! event legally causes and returns them for the driver to emit; illegal or
//! redundant moves produce nothing.

use serde::Serialize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase / status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Transcribe,
    Draft,
    Review,
    Export,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Transcribe, Phase::Draft, Phase::Review, Phase::Export];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Draft => "draft",
            Self::Review => "review",
            Self::Export => "export",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Transcribe => 0,
            Self::Draft => 1,
            Self::Review => 2,
            Self::Export => 3,
        }
    }

    fn next(self) -> Option<Phase> {
        match self {
            Self::Transcribe => Some(Self::Draft),
            Self::Draft => Some(Self::Review),
            Self::Review => Some(Self::Export),
            Self::Export => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// One applied transition, ready to be emitted as a `status` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub status: PhaseStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Board
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Driver-task-local phase tracker.
#[derive(Debug)]
pub struct PhaseBoard {
    statuses: [PhaseStatus; 4],
}

impl Default for PhaseBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseBoard {
    pub fn new() -> Self {
        Self {
            statuses: [PhaseStatus::Pending; 4],
        }
    }

    pub fn status(&self, phase: Phase) -> PhaseStatus {
        self.statuses[phase.index()]
    }

    /// The rightmost non-pending phase.
    pub fn current(&self) -> Option<Phase> {
        Phase::ALL
            .iter()
            .rev()
            .copied()
            .find(|p| self.statuses[p.index()] != PhaseStatus::Pending)
    }

    /// Apply one transition. Terminal phases never move again and setting a
    /// phase to its current status is a no-op; both return `None`.
    pub fn set(&mut self, phase: Phase, status: PhaseStatus) -> Option<PhaseTransition> {
        let slot = &mut self.statuses[phase.index()];
        if slot.is_terminal() || *slot == status {
            return None;
        }
        *slot = status;
        Some(PhaseTransition { phase, status })
    }

    /// A tool-use block for `phase`'s tool was observed. Later-phase tool
    /// use implies earlier phases that are still running have finished.
    pub fn on_tool_use(&mut self, phase: Phase) -> Vec<PhaseTransition> {
        let mut transitions = Vec::new();
        match phase {
            Phase::Transcribe => {}
            Phase::Draft => {
                if self.status(Phase::Transcribe) == PhaseStatus::Running {
                    transitions.extend(self.set(Phase::Transcribe, PhaseStatus::Success));
                }
            }
            Phase::Export => {
                if self.status(Phase::Draft) == PhaseStatus::Running {
                    transitions.extend(self.set(Phase::Draft, PhaseStatus::Success));
                }
                if self.status(Phase::Review) == PhaseStatus::Running {
                    transitions.extend(self.set(Phase::Review, PhaseStatus::Success));
                }
            }
            Phase::Review => {}
        }
        transitions.extend(self.set(phase, PhaseStatus::Running));
        transitions
    }

    /// A successful tool-result for `phase`'s tool: the phase completes and
    /// its successor starts.
    pub fn on_tool_success(&mut self, phase: Phase) -> Vec<PhaseTransition> {
        let mut transitions = Vec::new();
        transitions.extend(self.set(phase, PhaseStatus::Success));
        if let Some(next) = phase.next() {
            if self.status(next) == PhaseStatus::Pending {
                transitions.extend(self.set(next, PhaseStatus::Running));
            }
        }
        transitions
    }

    /// An error tool-result: the phase fails, nothing downstream moves.
    pub fn on_tool_error(&mut self, phase: Phase) -> Vec<PhaseTransition> {
        self.set(phase, PhaseStatus::Error).into_iter().collect()
    }

    /// A reviewer verdict. Approval completes review; a rejection with no
    /// rounds remaining fails it.
    pub fn on_verdict(&mut self, approved: bool, rounds_exhausted: bool) -> Vec<PhaseTransition> {
        let transition = if approved {
            self.set(Phase::Review, PhaseStatus::Success)
        } else if rounds_exhausted {
            self.set(Phase::Review, PhaseStatus::Error)
        } else {
            None
        };
        transition.into_iter().collect()
    }
}
