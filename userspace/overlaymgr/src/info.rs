// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Overlay approval states and the read-only snapshot handed to consumers.

use std::fmt;

/// Approval state computed for an overlay row.
///
/// The integer encoding is stable and is what the persisted table stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayState {
    /// No approval decision has been made yet.
    NotApprovedUnknown,
    /// The overlay package is disabled, or is a system overlay.
    NotApprovedComponentDisabled,
    /// The target package is not installed for the user.
    NotApprovedMissingTarget,
    /// No idmap exists for the overlay.
    NotApprovedNoIdmap,
    /// The overlay touches resources it was not granted.
    NotApprovedDangerousOverlay,
    /// Approved, but not applied.
    ApprovedDisabled,
    /// Approved and applied.
    ApprovedEnabled,
}

impl OverlayState {
    /// Every state, in encoding order.
    pub const ALL: [OverlayState; 7] = [
        OverlayState::NotApprovedUnknown,
        OverlayState::NotApprovedComponentDisabled,
        OverlayState::NotApprovedMissingTarget,
        OverlayState::NotApprovedNoIdmap,
        OverlayState::NotApprovedDangerousOverlay,
        OverlayState::ApprovedDisabled,
        OverlayState::ApprovedEnabled,
    ];

    /// Returns the stable integer encoding.
    pub const fn as_i32(self) -> i32 {
        match self {
            OverlayState::NotApprovedUnknown => -1,
            OverlayState::NotApprovedComponentDisabled => 0,
            OverlayState::NotApprovedMissingTarget => 1,
            OverlayState::NotApprovedNoIdmap => 2,
            OverlayState::NotApprovedDangerousOverlay => 3,
            OverlayState::ApprovedDisabled => 4,
            OverlayState::ApprovedEnabled => 5,
        }
    }

    /// Decodes a stable integer, returning `None` for unknown values.
    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_i32() == value)
    }

    /// Upper-case name used in logs and dumps.
    pub const fn name(self) -> &'static str {
        match self {
            OverlayState::NotApprovedUnknown => "STATE_NOT_APPROVED_UNKNOWN",
            OverlayState::NotApprovedComponentDisabled => "STATE_NOT_APPROVED_COMPONENT_DISABLED",
            OverlayState::NotApprovedMissingTarget => "STATE_NOT_APPROVED_MISSING_TARGET",
            OverlayState::NotApprovedNoIdmap => "STATE_NOT_APPROVED_NO_IDMAP",
            OverlayState::NotApprovedDangerousOverlay => "STATE_NOT_APPROVED_DANGEROUS_OVERLAY",
            OverlayState::ApprovedDisabled => "STATE_APPROVED_DISABLED",
            OverlayState::ApprovedEnabled => "STATE_APPROVED_ENABLED",
        }
    }

    /// True for both approved states.
    pub const fn is_approved(self) -> bool {
        matches!(self, OverlayState::ApprovedDisabled | OverlayState::ApprovedEnabled)
    }
}

impl fmt::Display for OverlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable snapshot of a visible overlay row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayInfo {
    /// Overlay package name.
    pub package_name: String,
    /// Package whose resources the overlay replaces.
    pub target_package_name: String,
    /// Installed location of the overlay artifact.
    pub base_code_path: String,
    /// Computed approval state.
    pub state: OverlayState,
    /// User the row belongs to.
    pub user_id: i32,
}

impl OverlayInfo {
    /// Whether the overlay is applied to its target.
    pub fn is_enabled(&self) -> bool {
        self.state == OverlayState::ApprovedEnabled
    }

    /// Whether the overlay passed approval, enabled or not.
    pub fn is_approved(&self) -> bool {
        self.state.is_approved()
    }
}

impl fmt::Display for OverlayInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OverlayInfo {{ overlay={}, target={}, state={}, user={} }}",
            self.package_name, self.target_package_name, self.state, self.user_id
        )
    }
}
