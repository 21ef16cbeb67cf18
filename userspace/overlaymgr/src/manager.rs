// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Thread-safe overlay manager facade
//! INTENT: Serialise entry points, restore the table at startup, persist it after changes
//! DEPS: parking_lot (lock), OverlayManagerService, OverlayDatabase XML persistence
//! INVARIANTS: Every entry point runs under one lock; the state file is only ever
//!             replaced by rename, never written in place
//! TESTS: tests/manager.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{ConfigError, OverlayConfig};
use crate::database::{ChangeEvent, ListenerId, OverlayDatabase};
use crate::idmap::{IdmapManager, Installer};
use crate::info::OverlayInfo;
use crate::package::PackageManagerHelper;
use crate::persist::PersistError;
use crate::service::OverlayManagerService;

/// Errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The config file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The state file could not be written.
    #[error("failed to persist overlay state to {path}: {source}")]
    Persist {
        /// State file being written.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: PersistError,
    },
}

struct Inner<P, I> {
    service: OverlayManagerService<P, I>,
    state_file: Option<PathBuf>,
}

/// Owns the overlay core and keeps the state file in step with it.
pub struct OverlayManager<P, I> {
    inner: Mutex<Inner<P, I>>,
    dirty: Arc<AtomicBool>,
}

impl<P, I> OverlayManager<P, I>
where
    P: PackageManagerHelper,
    I: Installer,
{
    /// Builds the manager and restores the persisted table, if any.
    ///
    /// A state file that cannot be read or parsed is logged and the manager
    /// starts with an empty table.
    pub fn new(config: &OverlayConfig, package_manager: P, installer: I) -> Self {
        let idmap_manager = IdmapManager::with_cache_dir(installer, &config.resource_cache_dir);
        let mut database = OverlayDatabase::new();
        if let Some(path) = &config.state_file {
            restore_from(&mut database, path);
        }

        let dirty = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dirty);
        database.add_change_listener(move |_event: &ChangeEvent| flag.store(true, Ordering::Release));

        Self {
            inner: Mutex::new(Inner {
                service: OverlayManagerService::new(package_manager, idmap_manager, database),
                state_file: config.state_file.clone(),
            }),
            dirty,
        }
    }

    /// Loads the TOML config at `path` and builds the manager from it.
    pub fn from_config_file(
        path: &Path,
        package_manager: P,
        installer: I,
    ) -> Result<Self, ManagerError> {
        let config = OverlayConfig::load(path)?;
        Ok(Self::new(&config, package_manager, installer))
    }

    /// Registers an additional change listener on the table.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        self.inner.lock().service.database_mut().add_change_listener(listener)
    }

    /// Unregisters a listener added through [`Self::add_change_listener`].
    pub fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.inner.lock().service.database_mut().remove_change_listener(id)
    }

    /// Rebuilds the rows of a user; returns the targets to refresh.
    pub fn on_switch_user(&self, new_user_id: i32) -> BTreeSet<String> {
        self.with_service(|service| service.on_switch_user(new_user_id))
    }

    /// Drops every row of a removed user.
    pub fn on_user_removed(&self, user_id: i32) {
        self.with_service(|service| service.on_user_removed(user_id))
    }

    /// A target package was installed.
    pub fn on_target_package_added(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_target_package_added(package_name, user_id))
    }

    /// A target package changed.
    pub fn on_target_package_changed(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_target_package_changed(package_name, user_id))
    }

    /// A target package is being replaced.
    pub fn on_target_package_upgrading(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_target_package_upgrading(package_name, user_id))
    }

    /// A target package finished being replaced.
    pub fn on_target_package_upgraded(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_target_package_upgraded(package_name, user_id))
    }

    /// A target package was uninstalled.
    pub fn on_target_package_removed(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_target_package_removed(package_name, user_id))
    }

    /// An overlay package was installed.
    pub fn on_overlay_package_added(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_overlay_package_added(package_name, user_id))
    }

    /// An overlay package changed without being reinstalled.
    pub fn on_overlay_package_changed(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_overlay_package_changed(package_name, user_id))
    }

    /// An overlay package is being replaced.
    pub fn on_overlay_package_upgrading(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_overlay_package_upgrading(package_name, user_id))
    }

    /// An overlay package finished being replaced.
    pub fn on_overlay_package_upgraded(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_overlay_package_upgraded(package_name, user_id))
    }

    /// An overlay package was uninstalled.
    pub fn on_overlay_package_removed(&self, package_name: &str, user_id: i32) {
        self.with_service(|service| service.on_overlay_package_removed(package_name, user_id))
    }

    /// Records an enable request; `false` if the overlay is unknown.
    pub fn set_enabled(&self, package_name: &str, enable: bool, user_id: i32) -> bool {
        self.with_service(|service| service.on_set_enabled(package_name, enable, user_id))
    }

    /// Moves an overlay directly in front of another overlay of the same target.
    pub fn set_priority(&self, package_name: &str, new_parent_package_name: &str, user_id: i32) -> bool {
        self.with_service(|service| {
            service.on_set_priority(package_name, new_parent_package_name, user_id)
        })
    }

    /// Makes an overlay win over every other overlay of its target.
    pub fn set_highest_priority(&self, package_name: &str, user_id: i32) -> bool {
        self.with_service(|service| service.on_set_highest_priority(package_name, user_id))
    }

    /// Makes an overlay lose to every other overlay of its target.
    pub fn set_lowest_priority(&self, package_name: &str, user_id: i32) -> bool {
        self.with_service(|service| service.on_set_lowest_priority(package_name, user_id))
    }

    /// Snapshot of one overlay.
    pub fn overlay_info(&self, package_name: &str, user_id: i32) -> Option<OverlayInfo> {
        self.inner.lock().service.on_get_overlay_info(package_name, user_id)
    }

    /// Overlays of a target, lowest priority first.
    pub fn overlay_infos_for_target(&self, target_package_name: &str, user_id: i32) -> Vec<OverlayInfo> {
        self.inner.lock().service.on_get_overlay_infos_for_target(target_package_name, user_id)
    }

    /// Overlays of a user grouped by target.
    pub fn overlays_for_user(&self, user_id: i32) -> BTreeMap<String, Vec<OverlayInfo>> {
        self.inner.lock().service.on_get_overlays_for_user(user_id)
    }

    /// Resource paths for a target, `None` if it is missing or an overlay.
    pub fn asset_paths(&self, target_package_name: &str, user_id: i32) -> Option<Vec<String>> {
        self.inner.lock().service.on_get_asset_paths(target_package_name, user_id)
    }

    /// Human readable table dump.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.inner.lock().service.on_dump(&mut out);
        out
    }

    /// Writes the table now, whether or not it changed.
    pub fn persist(&self) -> Result<(), ManagerError> {
        let inner = self.inner.lock();
        let Some(path) = &inner.state_file else {
            return Ok(());
        };
        self.dirty.store(false, Ordering::Release);
        write_atomic(inner.service.database(), path)
            .map_err(|source| ManagerError::Persist { path: path.clone(), source })
    }

    fn with_service<R>(&self, f: impl FnOnce(&mut OverlayManagerService<P, I>) -> R) -> R {
        let mut inner = self.inner.lock();
        let rows_before = inner.service.database().len();
        let result = f(&mut inner.service);
        // Rows that are added or dropped while hidden raise no event.
        let resized = inner.service.database().len() != rows_before;
        if self.dirty.swap(false, Ordering::AcqRel) || resized {
            if let Some(path) = &inner.state_file {
                if let Err(err) = write_atomic(inner.service.database(), path) {
                    error!("failed to persist overlay state to {}: {err}", path.display());
                    // Retry on the next change.
                    self.dirty.store(true, Ordering::Release);
                }
            }
        }
        result
    }
}

fn restore_from(database: &mut OverlayDatabase, path: &Path) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("no overlay state at {}, starting empty", path.display());
            return;
        }
        Err(err) => {
            error!("failed to open overlay state {}: {err}", path.display());
            return;
        }
    };
    match database.restore(BufReader::new(file)) {
        Ok(()) => info!("restored {} overlay rows from {}", database.len(), path.display()),
        Err(err) => error!("failed to restore overlay state from {}: {err}", path.display()),
    }
}

fn write_atomic(database: &OverlayDatabase, path: &Path) -> Result<(), PersistError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let tmp = path.with_extension("xml.tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        database.persist(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
