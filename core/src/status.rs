//! Registration status state machine.
//!
//! Every registration carries two independent tracks (graduation and
//! internship) with the same shape:
//!
//! ```text
//! not_reporting ──► reporting ⇄ not_yet_reporting ──► completed
//!                      │                               ▲
//!                      └───────────────────────────────┘
//!
//! any state except completed ──► exempted
//! ```
//!
//! `completed` and `exempted` are terminal except for the administrative
//! revert back to `reporting`.
//!
//! The internship track has an extra approval gate,
//! `internshipRegistrationStatus ∈ {pending, approved, rejected}`, which
//! decides whether placement fields may still change and whether the track may
//! advance past `reporting`.
//!
//! Staff transitions are expressed as [`StaffAction`]s fed to
//! [`StatusReducer`], a pure reducer over [`DefenseRegistration`]. The runtime
//! persists the resulting field diff; none of these transitions touch the
//! capacity ledger.

use crate::catalog::SupervisorRef;
use crate::environment::Clock;
use crate::reducer::Reducer;
use crate::registration::{DefenseRegistration, ExemptionDecision};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Progress of one reporting track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Active, report pending
    Reporting,
    /// Exempted by a staff decision (terminal)
    Exempted,
    /// Reporting but evidence not yet submitted
    NotYetReporting,
    /// Opted out
    NotReporting,
    /// Finished (terminal)
    Completed,
}

impl TrackStatus {
    /// Stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reporting => "reporting",
            Self::Exempted => "exempted",
            Self::NotYetReporting => "not_yet_reporting",
            Self::NotReporting => "not_reporting",
            Self::Completed => "completed",
        }
    }

    /// Whether only a revert can leave this state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Exempted)
    }

    /// Forward transitions permitted to staff (reverts are handled separately).
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::NotReporting, Self::Reporting | Self::Exempted)
            | (
                Self::Reporting,
                Self::NotYetReporting | Self::NotReporting | Self::Completed | Self::Exempted,
            )
            | (Self::NotYetReporting, Self::Reporting | Self::Completed | Self::Exempted) => true,
            _ => false,
        }
    }

    /// Whether the administrative revert applies from this state.
    #[must_use]
    pub const fn can_revert(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::NotYetReporting | Self::Exempted
        )
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval gate for an internship registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Submitted, awaiting staff review
    Pending,
    /// Accepted by staff
    Approved,
    /// Refused; the student may submit again
    Rejected,
}

impl ApprovalStatus {
    /// Stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Whether placement fields are frozen in this state.
    #[must_use]
    pub const fn locks_placement(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two tracks an action targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    /// Graduation thesis / defense
    Graduation,
    /// Internship report
    Internship,
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Graduation => "graduation",
            Self::Internship => "internship",
        })
    }
}

/// Staff-issued transition on a single registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StaffAction {
    /// `pending → approved`; internship track moves to `not_yet_reporting`
    ApproveInternship,
    /// `pending → rejected`
    RejectInternship {
        /// Reason shown to the student
        reason: Option<String>,
    },
    /// Move a track to `reporting`
    MarkReporting(ReportType),
    /// Move a track to `not_yet_reporting`
    MarkNotYetReporting(ReportType),
    /// Move a track to `completed`
    MarkCompleted(ReportType),
    /// Move a track to `not_reporting`
    OptOut(ReportType),
    /// Exempt a track, recording the decision
    GrantExemption {
        /// Track to exempt
        track: ReportType,
        /// Decision metadata
        decision: ExemptionDecision,
    },
    /// Administrative override back to `reporting`, clearing exemption metadata
    RevertToReporting(ReportType),
    /// Set the supervisor snapshot of a track
    AssignSupervisor {
        /// Track whose supervisor changes
        track: ReportType,
        /// New supervisor
        supervisor: SupervisorRef,
    },
}

impl StaffAction {
    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ApproveInternship => "approve_internship",
            Self::RejectInternship { .. } => "reject_internship",
            Self::MarkReporting(_) => "mark_reporting",
            Self::MarkNotYetReporting(_) => "mark_not_yet_reporting",
            Self::MarkCompleted(_) => "mark_completed",
            Self::OptOut(_) => "opt_out",
            Self::GrantExemption { .. } => "grant_exemption",
            Self::RevertToReporting(_) => "revert_to_reporting",
            Self::AssignSupervisor { .. } => "assign_supervisor",
        }
    }
}

/// A staff action that the current state does not permit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// Track transition not in the state machine.
    #[error("Cannot move {track} track from {from} to {to}")]
    InvalidTransition {
        /// Track concerned
        track: ReportType,
        /// Current state
        from: TrackStatus,
        /// Requested state
        to: TrackStatus,
    },

    /// Approval decision requires a pending registration.
    #[error("Internship registration is {}, expected pending", display_approval(.current))]
    NotPending {
        /// Current approval status (`None` when never submitted)
        current: Option<ApprovalStatus>,
    },

    /// Internship track cannot advance before approval.
    #[error("Internship registration must be approved before moving to {to}")]
    ApprovalRequired {
        /// Requested state
        to: TrackStatus,
    },
}

fn display_approval(status: &Option<ApprovalStatus>) -> &'static str {
    status.as_ref().map_or("unsubmitted", ApprovalStatus::as_str)
}

/// Environment for [`StatusReducer`].
#[derive(Clone)]
pub struct StatusEnvironment {
    /// Clock for review timestamps
    pub clock: Arc<dyn Clock>,
}

impl StatusEnvironment {
    /// Creates a new `StatusEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

/// Pure reducer applying [`StaffAction`]s to a registration.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusReducer;

impl StatusReducer {
    /// Creates a new `StatusReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn move_track(
        state: &mut DefenseRegistration,
        track: ReportType,
        to: TrackStatus,
    ) -> Result<(), TransitionError> {
        let from = state.track_status(track);
        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { track, from, to });
        }
        if track == ReportType::Internship
            && matches!(to, TrackStatus::NotYetReporting | TrackStatus::Completed)
            && state.internship_registration_status != Some(ApprovalStatus::Approved)
        {
            return Err(TransitionError::ApprovalRequired { to });
        }
        state.set_track_status(track, to);
        Ok(())
    }

    fn require_pending(state: &DefenseRegistration) -> Result<(), TransitionError> {
        match state.internship_registration_status {
            Some(ApprovalStatus::Pending) => Ok(()),
            current => Err(TransitionError::NotPending { current }),
        }
    }
}

impl Reducer for StatusReducer {
    type State = DefenseRegistration;
    type Action = StaffAction;
    type Environment = StatusEnvironment;
    type Error = TransitionError;

    fn reduce(
        &self,
        state: &mut DefenseRegistration,
        action: StaffAction,
        env: &StatusEnvironment,
    ) -> Result<(), TransitionError> {
        match action {
            StaffAction::ApproveInternship => {
                Self::require_pending(state)?;
                state.internship_registration_status = Some(ApprovalStatus::Approved);
                state.internship_status = Some(TrackStatus::NotYetReporting);
                state.internship_rejection_reason = None;
                state.internship_reviewed_at = Some(env.clock.now());
                Ok(())
            }
            StaffAction::RejectInternship { reason } => {
                Self::require_pending(state)?;
                state.internship_registration_status = Some(ApprovalStatus::Rejected);
                state.internship_rejection_reason = reason;
                state.internship_reviewed_at = Some(env.clock.now());
                Ok(())
            }
            StaffAction::MarkReporting(track) => {
                Self::move_track(state, track, TrackStatus::Reporting)
            }
            StaffAction::MarkNotYetReporting(track) => {
                Self::move_track(state, track, TrackStatus::NotYetReporting)
            }
            StaffAction::MarkCompleted(track) => {
                Self::move_track(state, track, TrackStatus::Completed)
            }
            StaffAction::OptOut(track) => {
                Self::move_track(state, track, TrackStatus::NotReporting)
            }
            StaffAction::GrantExemption { track, decision } => {
                Self::move_track(state, track, TrackStatus::Exempted)?;
                state.set_exemption(track, Some(decision));
                Ok(())
            }
            StaffAction::RevertToReporting(track) => {
                let from = state.track_status(track);
                if !from.can_revert() {
                    return Err(TransitionError::InvalidTransition {
                        track,
                        from,
                        to: TrackStatus::Reporting,
                    });
                }
                state.set_track_status(track, TrackStatus::Reporting);
                state.set_exemption(track, None);
                Ok(())
            }
            StaffAction::AssignSupervisor { track, supervisor } => {
                state.set_supervisor(track, Some(supervisor));
                Ok(())
            }
        }
    }
}
