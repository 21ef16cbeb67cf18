// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ordered overlay table keyed by (package, user)
//! INTENT: Row CRUD, state/enable mutation with change notification, priority reordering
//! DEPS: quick-xml via `persist` for restore/persist
//! INVARIANTS: At most one row per (package, user); table order is priority order
//!             (front = lowest); rows being upgraded are hidden from every query
//! TESTS: notification law, priority moves, uniqueness (proptest)

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, Write};

use log::error;
use thiserror::Error;

use crate::info::{OverlayInfo, OverlayState};
use crate::persist::{self, PersistError};

/// Result alias for table lookups.
pub type Result<T> = core::result::Result<T, DatabaseError>;

/// Errors produced by the overlay table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// No row exists for the key.
    #[error("bad key packageName={package_name} userId={user_id}")]
    NotFound {
        /// Overlay package of the missing row.
        package_name: String,
        /// User of the missing row.
        user_id: i32,
    },
}

/// Notification emitted after the table changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Anything in the table changed; fired after the more specific events.
    DatabaseChanged,
    /// A row received its first approval decision.
    OverlayAdded(OverlayInfo),
    /// A visible row left the table or became hidden.
    OverlayRemoved(OverlayInfo),
    /// The state of a visible row changed.
    OverlayChanged {
        /// Snapshot after the change.
        current: OverlayInfo,
        /// Snapshot before the change.
        previous: OverlayInfo,
    },
    /// A row moved within the table.
    OverlayPriorityChanged(OverlayInfo),
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&ChangeEvent) + Send>;

pub(crate) struct OverlayRow {
    pub(crate) package_name: String,
    pub(crate) user_id: i32,
    pub(crate) target_package_name: String,
    base_code_path: String,
    state: OverlayState,
    enabled: bool,
    upgrading: bool,
    // Cleared by every setter that changes a field the snapshot carries.
    cache: OnceCell<OverlayInfo>,
}

impl OverlayRow {
    fn new(package_name: &str, user_id: i32, target_package_name: &str, base_code_path: &str) -> Self {
        Self::restored(
            package_name.to_string(),
            user_id,
            target_package_name.to_string(),
            base_code_path.to_string(),
            OverlayState::NotApprovedUnknown,
            false,
            false,
        )
    }

    pub(crate) fn restored(
        package_name: String,
        user_id: i32,
        target_package_name: String,
        base_code_path: String,
        state: OverlayState,
        enabled: bool,
        upgrading: bool,
    ) -> Self {
        Self {
            package_name,
            user_id,
            target_package_name,
            base_code_path,
            state,
            enabled,
            upgrading,
            cache: OnceCell::new(),
        }
    }

    fn matches(&self, package_name: &str, user_id: i32) -> bool {
        self.user_id == user_id && self.package_name == package_name
    }

    pub(crate) fn base_code_path(&self) -> &str {
        &self.base_code_path
    }

    pub(crate) fn state(&self) -> OverlayState {
        self.state
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn is_upgrading(&self) -> bool {
        self.upgrading
    }

    fn set_base_code_path(&mut self, path: &str) -> bool {
        if self.base_code_path == path {
            return false;
        }
        self.base_code_path = path.to_string();
        self.cache.take();
        true
    }

    fn set_state(&mut self, state: OverlayState) {
        if self.state != state {
            self.state = state;
            self.cache.take();
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.cache.take();
        }
    }

    fn set_upgrading(&mut self, upgrading: bool) {
        if self.upgrading != upgrading {
            self.upgrading = upgrading;
            self.cache.take();
        }
    }

    fn overlay_info(&self) -> Option<OverlayInfo> {
        if self.upgrading {
            return None;
        }
        let info = self.cache.get_or_init(|| OverlayInfo {
            package_name: self.package_name.clone(),
            target_package_name: self.target_package_name.clone(),
            base_code_path: self.base_code_path.clone(),
            state: self.state,
            user_id: self.user_id,
        });
        Some(info.clone())
    }
}

/// In-memory overlay table.
///
/// The table is not synchronised; callers serialise access. Listeners run on
/// the mutating call stack and must not mutate the table themselves.
#[derive(Default)]
pub struct OverlayDatabase {
    table: Vec<OverlayRow>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl OverlayDatabase {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, hidden ones included.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Replaces any row for the key with a fresh, undecided one appended at the end.
    pub fn init(
        &mut self,
        package_name: &str,
        user_id: i32,
        target_package_name: &str,
        base_code_path: &str,
    ) {
        self.remove(package_name, user_id);
        self.table.push(OverlayRow::new(package_name, user_id, target_package_name, base_code_path));
    }

    /// Deletes the row for the key, if any.
    pub fn remove(&mut self, package_name: &str, user_id: i32) {
        let Some(index) = self.position(package_name, user_id) else {
            return;
        };
        let row = self.table.remove(index);
        if let Some(info) = row.overlay_info() {
            self.notify(ChangeEvent::OverlayRemoved(info));
        }
    }

    /// Whether a row exists for the key, hidden or not.
    pub fn contains(&self, package_name: &str, user_id: i32) -> bool {
        self.position(package_name, user_id).is_some()
    }

    /// Snapshot of the row, `None` while it is upgrading.
    pub fn overlay_info(&self, package_name: &str, user_id: i32) -> Result<Option<OverlayInfo>> {
        Ok(self.row(package_name, user_id)?.overlay_info())
    }

    /// Target package recorded for the row.
    pub fn target_package_name(&self, package_name: &str, user_id: i32) -> Result<String> {
        Ok(self.row(package_name, user_id)?.target_package_name.clone())
    }

    /// Installed artifact path recorded for the row.
    pub fn base_code_path(&self, package_name: &str, user_id: i32) -> Result<String> {
        Ok(self.row(package_name, user_id)?.base_code_path.clone())
    }

    /// Records a new artifact path for the row.
    pub fn set_base_code_path(&mut self, package_name: &str, user_id: i32, path: &str) -> Result<()> {
        if self.row_mut(package_name, user_id)?.set_base_code_path(path) {
            self.notify(ChangeEvent::DatabaseChanged);
        }
        Ok(())
    }

    /// Whether the row is hidden by an in-progress upgrade.
    pub fn upgrading(&self, package_name: &str, user_id: i32) -> Result<bool> {
        Ok(self.row(package_name, user_id)?.is_upgrading())
    }

    /// Hides or reveals the row around an upgrade of the overlay package.
    ///
    /// Hiding resets the state to undecided and reports the row as removed.
    pub fn set_upgrading(&mut self, package_name: &str, user_id: i32, upgrading: bool) -> Result<()> {
        let row = self.row_mut(package_name, user_id)?;
        if row.is_upgrading() == upgrading {
            return Ok(());
        }
        if upgrading {
            let previous = row.overlay_info();
            row.set_upgrading(true);
            row.set_state(OverlayState::NotApprovedUnknown);
            if let Some(previous) = previous {
                self.notify(ChangeEvent::OverlayRemoved(previous));
            }
        } else {
            row.set_upgrading(false);
        }
        self.notify(ChangeEvent::DatabaseChanged);
        Ok(())
    }

    /// The caller's enable request for the row.
    pub fn enabled(&self, package_name: &str, user_id: i32) -> Result<bool> {
        Ok(self.row(package_name, user_id)?.is_enabled())
    }

    /// Records the caller's enable request; the state is recomputed separately.
    pub fn set_enabled(&mut self, package_name: &str, user_id: i32, enabled: bool) -> Result<()> {
        let row = self.row_mut(package_name, user_id)?;
        if row.is_enabled() == enabled {
            return Ok(());
        }
        row.set_enabled(enabled);
        self.notify(ChangeEvent::DatabaseChanged);
        Ok(())
    }

    /// Current approval state of the row.
    pub fn state(&self, package_name: &str, user_id: i32) -> Result<OverlayState> {
        Ok(self.row(package_name, user_id)?.state())
    }

    /// Applies a newly computed state.
    ///
    /// Leaving `NotApprovedUnknown` is reported as an addition, any other change
    /// as a modification. Setting the current state again notifies nobody. Rows
    /// hidden by an upgrade stay `NotApprovedUnknown` until they are revealed.
    pub fn set_state(&mut self, package_name: &str, user_id: i32, state: OverlayState) -> Result<()> {
        let row = self.row_mut(package_name, user_id)?;
        if row.is_upgrading() || row.state() == state {
            return Ok(());
        }
        let previous = row.overlay_info();
        row.set_state(state);
        let current = row.overlay_info();
        if let (Some(previous), Some(current)) = (previous, current) {
            if previous.state == OverlayState::NotApprovedUnknown {
                self.notify(ChangeEvent::OverlayAdded(current));
            } else {
                self.notify(ChangeEvent::OverlayChanged { current, previous });
            }
        }
        self.notify(ChangeEvent::DatabaseChanged);
        Ok(())
    }

    /// Visible overlays of `target_package_name`, lowest priority first.
    pub fn overlays_for_target(&self, target_package_name: &str, user_id: i32) -> Vec<OverlayInfo> {
        self.table
            .iter()
            .filter(|row| row.user_id == user_id && row.target_package_name == target_package_name)
            .filter_map(OverlayRow::overlay_info)
            .collect()
    }

    /// Visible overlays of `user_id`, grouped by target, each group in priority order.
    pub fn overlays_for_user(&self, user_id: i32) -> BTreeMap<String, Vec<OverlayInfo>> {
        let mut out: BTreeMap<String, Vec<OverlayInfo>> = BTreeMap::new();
        for row in self.table.iter().filter(|row| row.user_id == user_id) {
            if let Some(info) = row.overlay_info() {
                out.entry(row.target_package_name.clone()).or_default().push(info);
            }
        }
        out
    }

    /// Distinct targets with visible overlays for `user_id`, in first-seen order.
    pub fn target_package_names_for_user(&self, user_id: i32) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for row in self.table.iter().filter(|row| row.user_id == user_id && !row.is_upgrading()) {
            if !out.contains(&row.target_package_name) {
                out.push(row.target_package_name.clone());
            }
        }
        out
    }

    /// Distinct users with rows, in first-seen order.
    pub fn users(&self) -> Vec<i32> {
        let mut users = Vec::new();
        for row in &self.table {
            if !users.contains(&row.user_id) {
                users.push(row.user_id);
            }
        }
        users
    }

    /// Drops every row of `user_id`.
    pub fn remove_user(&mut self, user_id: i32) {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.table).into_iter().partition(|row| row.user_id == user_id);
        self.table = kept;
        if removed.is_empty() {
            return;
        }
        for info in removed.iter().filter_map(OverlayRow::overlay_info) {
            self.notify(ChangeEvent::OverlayRemoved(info));
        }
        self.notify(ChangeEvent::DatabaseChanged);
    }

    /// Moves the row directly in front of `new_parent_package_name`.
    ///
    /// Both rows must exist, be visible and share a target.
    pub fn set_priority(
        &mut self,
        package_name: &str,
        new_parent_package_name: &str,
        user_id: i32,
    ) -> bool {
        if package_name == new_parent_package_name {
            return false;
        }
        let Some(from) = self.visible_position(package_name, user_id) else {
            return false;
        };
        let Some(parent) = self.visible_position(new_parent_package_name, user_id) else {
            return false;
        };
        if self.table[from].target_package_name != self.table[parent].target_package_name {
            return false;
        }

        let row = self.table.remove(from);
        let Some(parent) = self.position(new_parent_package_name, user_id) else {
            error!("failed to find the parent row {new_parent_package_name}:{user_id} a second time");
            self.table.insert(from, row);
            return false;
        };
        self.table.insert(parent, row);
        self.notify_moved(parent);
        true
    }

    /// Moves the row to the front of the table.
    pub fn set_lowest_priority(&mut self, package_name: &str, user_id: i32) -> bool {
        let Some(index) = self.visible_position(package_name, user_id) else {
            return false;
        };
        let row = self.table.remove(index);
        self.table.insert(0, row);
        self.notify_moved(0);
        true
    }

    /// Moves the row to the end of the table.
    pub fn set_highest_priority(&mut self, package_name: &str, user_id: i32) -> bool {
        let Some(index) = self.visible_position(package_name, user_id) else {
            return false;
        };
        let row = self.table.remove(index);
        self.table.push(row);
        self.notify_moved(self.table.len() - 1);
        true
    }

    /// Replaces the table with the document read from `reader`.
    ///
    /// The table is empty afterwards if the document is rejected. No listener
    /// is notified.
    pub fn restore<R: BufRead>(&mut self, reader: R) -> core::result::Result<(), PersistError> {
        self.table.clear();
        self.table = persist::read_table(reader)?;
        Ok(())
    }

    /// Writes the table as an XML document.
    pub fn persist<W: Write>(&self, writer: W) -> core::result::Result<(), PersistError> {
        persist::write_table(&self.table, writer)
    }

    /// Registers `listener`; it is invoked for every subsequent change, in registration order.
    pub fn add_change_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Unregisters a listener; returns whether it was registered.
    pub fn remove_change_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(registered, _)| *registered != id);
        self.listeners.len() != before
    }

    /// Writes a human readable view of the table.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        const TAB1: &str = "    ";
        const TAB2: &str = "        ";
        const TAB3: &str = "            ";

        writeln!(out, "Database")?;
        writeln!(out, "{TAB1}Rows")?;
        if self.table.is_empty() {
            writeln!(out, "{TAB2}<none>")?;
        }
        for row in &self.table {
            writeln!(out, "{TAB2}{}:{} {{", row.package_name, row.user_id)?;
            writeln!(out, "{TAB3}package_name........: {}", row.package_name)?;
            writeln!(out, "{TAB3}user_id.............: {}", row.user_id)?;
            writeln!(out, "{TAB3}target_package_name.: {}", row.target_package_name)?;
            writeln!(out, "{TAB3}base_code_path......: {}", row.base_code_path)?;
            writeln!(out, "{TAB3}state...............: {}", row.state)?;
            writeln!(out, "{TAB3}enabled.............: {}", row.enabled)?;
            writeln!(out, "{TAB3}upgrading...........: {}", row.upgrading)?;
            writeln!(out, "{TAB2}}}")?;
        }
        writeln!(out, "{TAB1}Change listeners")?;
        if self.listeners.is_empty() {
            writeln!(out, "{TAB2}<none>")?;
        } else {
            writeln!(out, "{TAB2}{} registered", self.listeners.len())?;
        }
        Ok(())
    }

    fn position(&self, package_name: &str, user_id: i32) -> Option<usize> {
        self.table.iter().position(|row| row.matches(package_name, user_id))
    }

    fn visible_position(&self, package_name: &str, user_id: i32) -> Option<usize> {
        self.position(package_name, user_id).filter(|&index| !self.table[index].is_upgrading())
    }

    fn row(&self, package_name: &str, user_id: i32) -> Result<&OverlayRow> {
        self.table
            .iter()
            .find(|row| row.matches(package_name, user_id))
            .ok_or_else(|| bad_key(package_name, user_id))
    }

    fn row_mut(&mut self, package_name: &str, user_id: i32) -> Result<&mut OverlayRow> {
        self.table
            .iter_mut()
            .find(|row| row.matches(package_name, user_id))
            .ok_or_else(|| bad_key(package_name, user_id))
    }

    fn notify_moved(&mut self, index: usize) {
        if let Some(info) = self.table[index].overlay_info() {
            self.notify(ChangeEvent::OverlayPriorityChanged(info));
        }
        self.notify(ChangeEvent::DatabaseChanged);
    }

    fn notify(&mut self, event: ChangeEvent) {
        for (_, listener) in &mut self.listeners {
            listener(&event);
        }
    }
}

fn bad_key(package_name: &str, user_id: i32) -> DatabaseError {
    DatabaseError::NotFound { package_name: package_name.to_string(), user_id }
}
