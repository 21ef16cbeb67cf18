// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Overlay manager core – reacts to package lifecycle events
//! INTENT: Recompute overlay approval, keep idmaps and the overlay table consistent
//! DEPS: PackageManagerHelper (installed packages), IdmapManager (installer), OverlayDatabase
//! INVARIANTS: Callers serialise entry points; missing rows found mid-update are
//!             dropped from the table instead of being reported to the caller
//! TESTS: decision table (exhaustive); lifecycle flows live in tests/service_flow.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{debug, error, warn};

use crate::database::{DatabaseError, OverlayDatabase};
use crate::idmap::{IdmapManager, Installer};
use crate::info::{OverlayInfo, OverlayState};
use crate::package::{PackageInfo, PackageManagerHelper};

/// Facts the approval decision is made from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateInputs {
    /// The package manager reports the overlay component as enabled.
    pub component_enabled: bool,
    /// The target package is installed for the user.
    pub target_installed: bool,
    /// An idmap file exists for the overlay.
    pub idmap_exists: bool,
    /// The overlay is installed on the system partition.
    pub system_overlay: bool,
    /// The idmap header carries the dangerous flag.
    pub idmap_dangerous: bool,
    /// The caller asked for the overlay to be enabled.
    pub enabled: bool,
}

/// Ordered approval rules; the first matching rule decides.
pub fn decide_state(inputs: StateInputs) -> OverlayState {
    if !inputs.component_enabled {
        return OverlayState::NotApprovedComponentDisabled;
    }
    if !inputs.target_installed {
        return OverlayState::NotApprovedMissingTarget;
    }
    if !inputs.idmap_exists {
        return OverlayState::NotApprovedNoIdmap;
    }
    // System overlays are never approved here.
    if inputs.system_overlay {
        return OverlayState::NotApprovedComponentDisabled;
    }
    // Overlays that stay inside their grant are approved but left disabled.
    if !inputs.idmap_dangerous {
        return OverlayState::ApprovedDisabled;
    }
    if inputs.enabled {
        OverlayState::ApprovedEnabled
    } else {
        OverlayState::ApprovedDisabled
    }
}

/// Overlay manager core.
///
/// Not synchronised: the owner serialises every call.
pub struct OverlayManagerService<P, I> {
    package_manager: P,
    idmap_manager: IdmapManager<I>,
    database: OverlayDatabase,
}

impl<P, I> OverlayManagerService<P, I>
where
    P: PackageManagerHelper,
    I: Installer,
{
    /// Wires the core to its collaborators.
    pub fn new(package_manager: P, idmap_manager: IdmapManager<I>, database: OverlayDatabase) -> Self {
        Self { package_manager, idmap_manager, database }
    }

    /// The overlay table.
    pub fn database(&self) -> &OverlayDatabase {
        &self.database
    }

    /// Mutable access to the overlay table, for listener registration and restore.
    pub fn database_mut(&mut self) -> &mut OverlayDatabase {
        &mut self.database
    }

    /// The injected package lookup.
    pub fn package_manager(&self) -> &P {
        &self.package_manager
    }

    /// The idmap helper.
    pub fn idmap_manager(&self) -> &IdmapManager<I> {
        &self.idmap_manager
    }

    /// Rebuilds the rows of `new_user_id` from the installed overlay packages.
    ///
    /// Returns the installed targets whose overlays must be refreshed: those with
    /// active overlays plus those that lost overlays.
    pub fn on_switch_user(&mut self, new_user_id: i32) -> BTreeSet<String> {
        debug!("on_switch_user new_user_id={new_user_id}");

        let mut targets = BTreeSet::new();
        let mut stored: BTreeMap<String, OverlayInfo> = self
            .database
            .overlays_for_user(new_user_id)
            .into_values()
            .flatten()
            .map(|info| (info.package_name.clone(), info))
            .collect();

        for overlay in self.package_manager.get_overlay_packages(new_user_id) {
            let Some(target_name) = overlay.overlay_target.clone() else {
                warn!("{} is listed as an overlay but declares no target", overlay.package_name);
                continue;
            };

            let previous = stored.remove(&overlay.package_name);
            let same_target =
                previous.as_ref().is_some_and(|info| info.target_package_name == target_name);
            if !same_target {
                if let Some(previous) = previous {
                    targets.insert(previous.target_package_name);
                }
                self.database.init(
                    &overlay.package_name,
                    new_user_id,
                    &target_name,
                    overlay.base_code_path(),
                );
            }

            let target = self.package_manager.get_package_info(&target_name, new_user_id);
            if let Err(err) = self.update_state(target.as_ref(), &overlay, new_user_id) {
                self.drop_stale_row(&overlay.package_name, new_user_id, err);
            }
            targets.insert(target_name);
        }

        // Whatever is left is no longer installed.
        for info in stored.into_values() {
            self.database.remove(&info.package_name, info.user_id);
            self.remove_idmap_if_possible(&info);
            targets.insert(info.target_package_name);
        }

        targets.retain(|target| self.package_manager.get_package_info(target, new_user_id).is_some());
        targets
    }

    /// Drops every row of a removed user.
    pub fn on_user_removed(&mut self, user_id: i32) {
        debug!("on_user_removed user_id={user_id}");
        self.database.remove_user(user_id);
    }

    /// A target package was installed.
    pub fn on_target_package_added(&mut self, package_name: &str, user_id: i32) {
        debug!("on_target_package_added package_name={package_name} user_id={user_id}");
        let target = self.package_manager.get_package_info(package_name, user_id);
        self.update_all_overlays_for_target(package_name, user_id, target);
    }

    /// A target package changed, e.g. its component state.
    pub fn on_target_package_changed(&mut self, package_name: &str, user_id: i32) {
        debug!("on_target_package_changed package_name={package_name} user_id={user_id}");
        let target = self.package_manager.get_package_info(package_name, user_id);
        self.update_all_overlays_for_target(package_name, user_id, target);
    }

    /// A target package is being replaced; its overlays see it as missing meanwhile.
    pub fn on_target_package_upgrading(&mut self, package_name: &str, user_id: i32) {
        debug!("on_target_package_upgrading package_name={package_name} user_id={user_id}");
        self.update_all_overlays_for_target(package_name, user_id, None);
    }

    /// A target package finished being replaced.
    pub fn on_target_package_upgraded(&mut self, package_name: &str, user_id: i32) {
        debug!("on_target_package_upgraded package_name={package_name} user_id={user_id}");
        let target = self.package_manager.get_package_info(package_name, user_id);
        self.update_all_overlays_for_target(package_name, user_id, target);
    }

    /// A target package was uninstalled.
    pub fn on_target_package_removed(&mut self, package_name: &str, user_id: i32) {
        debug!("on_target_package_removed package_name={package_name} user_id={user_id}");
        self.update_all_overlays_for_target(package_name, user_id, None);
    }

    /// An overlay package was installed.
    pub fn on_overlay_package_added(&mut self, package_name: &str, user_id: i32) {
        debug!("on_overlay_package_added package_name={package_name} user_id={user_id}");
        let Some((overlay, target_name)) = self.installed_overlay(package_name, user_id, "added")
        else {
            return;
        };

        let target = self.package_manager.get_package_info(&target_name, user_id);
        self.database.init(package_name, user_id, &target_name, overlay.base_code_path());
        if let Err(err) = self.update_state(target.as_ref(), &overlay, user_id) {
            self.drop_stale_row(package_name, user_id, err);
        }
    }

    /// An overlay package changed without being reinstalled.
    pub fn on_overlay_package_changed(&mut self, package_name: &str, user_id: i32) {
        debug!("on_overlay_package_changed package_name={package_name} user_id={user_id}");
        let Some((overlay, target_name)) = self.installed_overlay(package_name, user_id, "changed")
        else {
            return;
        };
        // The upgraded event recomputes the row once the new package is in place.
        if let Ok(true) = self.database.upgrading(package_name, user_id) {
            debug!("{package_name}:{user_id}: upgrading, not recomputing");
            return;
        }

        let target = self.package_manager.get_package_info(&target_name, user_id);
        if let Err(err) = self.update_state(target.as_ref(), &overlay, user_id) {
            self.drop_stale_row(package_name, user_id, err);
        }
    }

    /// An overlay package is being replaced: hide its row and release its idmap.
    pub fn on_overlay_package_upgrading(&mut self, package_name: &str, user_id: i32) {
        debug!("on_overlay_package_upgrading package_name={package_name} user_id={user_id}");
        let result = self.database.overlay_info(package_name, user_id).and_then(|info| {
            self.database.set_upgrading(package_name, user_id, true)?;
            Ok(info)
        });
        match result {
            Ok(Some(info)) => self.remove_idmap_if_possible(&info),
            Ok(None) => {}
            Err(err) => self.drop_stale_row(package_name, user_id, err),
        }
    }

    /// An overlay package finished being replaced.
    ///
    /// A new version that points at a different target starts over as a fresh overlay.
    pub fn on_overlay_package_upgraded(&mut self, package_name: &str, user_id: i32) {
        debug!("on_overlay_package_upgraded package_name={package_name} user_id={user_id}");
        let Some((overlay, target_name)) = self.installed_overlay(package_name, user_id, "upgraded")
        else {
            return;
        };

        let stored_target = match self.database.target_package_name(package_name, user_id) {
            Ok(stored_target) => stored_target,
            Err(err) => {
                self.drop_stale_row(package_name, user_id, err);
                return;
            }
        };
        if stored_target != target_name {
            debug!("{package_name}:{user_id}: target changed from {stored_target} to {target_name}");
            self.database.remove(package_name, user_id);
            self.on_overlay_package_added(package_name, user_id);
            return;
        }

        let target = self.package_manager.get_package_info(&target_name, user_id);
        let result = self
            .database
            .set_upgrading(package_name, user_id, false)
            .and_then(|()| self.update_state(target.as_ref(), &overlay, user_id));
        if let Err(err) = result {
            self.drop_stale_row(package_name, user_id, err);
        }
    }

    /// An overlay package was uninstalled for `user_id`.
    pub fn on_overlay_package_removed(&mut self, package_name: &str, user_id: i32) {
        debug!("on_overlay_package_removed package_name={package_name} user_id={user_id}");
        match self.database.overlay_info(package_name, user_id) {
            Ok(info) => {
                self.database.remove(package_name, user_id);
                if let Some(info) = info {
                    self.remove_idmap_if_possible(&info);
                }
            }
            Err(err) => error!("failed to remove overlay package: {err}"),
        }
    }

    /// Snapshot of one overlay, `None` if unknown or upgrading.
    pub fn on_get_overlay_info(&self, package_name: &str, user_id: i32) -> Option<OverlayInfo> {
        self.database.overlay_info(package_name, user_id).ok().flatten()
    }

    /// Overlays of a target, lowest priority first.
    pub fn on_get_overlay_infos_for_target(
        &self,
        target_package_name: &str,
        user_id: i32,
    ) -> Vec<OverlayInfo> {
        self.database.overlays_for_target(target_package_name, user_id)
    }

    /// Overlays of a user grouped by target.
    pub fn on_get_overlays_for_user(&self, user_id: i32) -> BTreeMap<String, Vec<OverlayInfo>> {
        self.database.overlays_for_user(user_id)
    }

    /// Records an enable request and recomputes the overlay's state.
    ///
    /// Returns `false` if the overlay is not installed or has no row.
    pub fn on_set_enabled(&mut self, package_name: &str, enable: bool, user_id: i32) -> bool {
        debug!("on_set_enabled package_name={package_name} enable={enable} user_id={user_id}");
        let Some(overlay) = self.package_manager.get_package_info(package_name, user_id) else {
            return false;
        };
        match self.apply_enabled(&overlay, enable, user_id) {
            Ok(()) => true,
            Err(err) => {
                debug!("on_set_enabled failed: {err}");
                false
            }
        }
    }

    /// Moves an overlay directly in front of another overlay of the same target.
    pub fn on_set_priority(
        &mut self,
        package_name: &str,
        new_parent_package_name: &str,
        user_id: i32,
    ) -> bool {
        self.database.set_priority(package_name, new_parent_package_name, user_id)
    }

    /// Makes an overlay win over every other overlay of its target.
    pub fn on_set_highest_priority(&mut self, package_name: &str, user_id: i32) -> bool {
        self.database.set_highest_priority(package_name, user_id)
    }

    /// Makes an overlay lose to every other overlay of its target.
    pub fn on_set_lowest_priority(&mut self, package_name: &str, user_id: i32) -> bool {
        self.database.set_lowest_priority(package_name, user_id)
    }

    /// Resource paths for a target: its own artifact followed by its enabled
    /// overlays, lowest priority first.
    ///
    /// `None` if the package is unknown or is itself an overlay.
    pub fn on_get_asset_paths(&self, target_package_name: &str, user_id: i32) -> Option<Vec<String>> {
        let target = self.package_manager.get_package_info(target_package_name, user_id)?;
        if target.is_overlay() {
            return None;
        }
        let mut paths = vec![target.base_code_path().to_string()];
        paths.extend(
            self.database
                .overlays_for_target(target_package_name, user_id)
                .into_iter()
                .filter(OverlayInfo::is_enabled)
                .map(|info| info.base_code_path),
        );
        Some(paths)
    }

    /// Writes the table dump.
    pub fn on_dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.database.dump(out)
    }

    fn installed_overlay(
        &mut self,
        package_name: &str,
        user_id: i32,
        event: &str,
    ) -> Option<(PackageInfo, String)> {
        let Some(overlay) = self.package_manager.get_package_info(package_name, user_id) else {
            warn!("overlay package {package_name} was {event}, but couldn't be found");
            self.on_overlay_package_removed(package_name, user_id);
            return None;
        };
        let Some(target_name) = overlay.overlay_target.clone() else {
            warn!("package {package_name} was {event}, but declares no overlay target");
            self.on_overlay_package_removed(package_name, user_id);
            return None;
        };
        Some((overlay, target_name))
    }

    fn update_all_overlays_for_target(
        &mut self,
        target_package_name: &str,
        user_id: i32,
        target: Option<PackageInfo>,
    ) {
        for info in self.database.overlays_for_target(target_package_name, user_id) {
            match self.package_manager.get_package_info(&info.package_name, user_id) {
                None => {
                    self.database.remove(&info.package_name, info.user_id);
                    self.remove_idmap_if_possible(&info);
                }
                Some(overlay) => {
                    if let Err(err) = self.update_state(target.as_ref(), &overlay, user_id) {
                        self.drop_stale_row(&info.package_name, user_id, err);
                    }
                }
            }
        }
    }

    fn apply_enabled(
        &mut self,
        overlay: &PackageInfo,
        enable: bool,
        user_id: i32,
    ) -> Result<(), DatabaseError> {
        let target_name = self.database.target_package_name(&overlay.package_name, user_id)?;
        let target = self.package_manager.get_package_info(&target_name, user_id);
        self.database.set_enabled(&overlay.package_name, user_id, enable)?;
        if self.database.upgrading(&overlay.package_name, user_id)? {
            // Applied when the upgrade completes.
            return Ok(());
        }
        self.update_state(target.as_ref(), overlay, user_id)
    }

    fn update_state(
        &mut self,
        target: Option<&PackageInfo>,
        overlay: &PackageInfo,
        user_id: i32,
    ) -> Result<(), DatabaseError> {
        // A failed idmap shows up below as a missing idmap.
        if let Some(target) = target {
            self.idmap_manager.create_idmap(target, overlay, user_id);
        }

        let package_name = overlay.package_name.as_str();
        self.database.set_base_code_path(package_name, user_id, overlay.base_code_path())?;

        let current = self.database.state(package_name, user_id)?;
        let next = self.calculate_new_state(target, overlay, user_id)?;
        if current != next {
            debug!("{package_name}:{user_id}: {current} -> {next}");
            self.database.set_state(package_name, user_id, next)?;
        }
        Ok(())
    }

    fn calculate_new_state(
        &self,
        target: Option<&PackageInfo>,
        overlay: &PackageInfo,
        user_id: i32,
    ) -> Result<OverlayState, DatabaseError> {
        let app = &overlay.application_info;
        let enabled = self.database.enabled(&overlay.package_name, user_id)?;
        let target_installed = target.is_some();
        let idmap_exists =
            target_installed && self.idmap_manager.idmap_exists_for_package(overlay, user_id);
        let system_overlay = app.is_system();
        // Only read the header when the decision can depend on it.
        let idmap_dangerous = app.enabled
            && idmap_exists
            && !system_overlay
            && self.idmap_manager.is_dangerous(overlay, user_id);

        Ok(decide_state(StateInputs {
            component_enabled: app.enabled,
            target_installed,
            idmap_exists,
            system_overlay,
            idmap_dangerous,
            enabled,
        }))
    }

    // Every user shares one idmap per overlay package, so it may only go once
    // no user has the overlay enabled.
    fn remove_idmap_if_possible(&self, info: &OverlayInfo) {
        if !self.idmap_manager.idmap_exists(info) {
            return;
        }
        for user_id in self.database.users() {
            if let Ok(Some(other)) = self.database.overlay_info(&info.package_name, user_id) {
                if other.is_enabled() {
                    debug!(
                        "keeping idmap for {}: still enabled for user {user_id}",
                        info.package_name
                    );
                    return;
                }
            }
        }
        self.idmap_manager.remove_idmap(info, info.user_id);
    }

    fn drop_stale_row(&mut self, package_name: &str, user_id: i32, err: DatabaseError) {
        error!("failed to update database: {err}");
        self.database.remove(package_name, user_id);
    }
}
