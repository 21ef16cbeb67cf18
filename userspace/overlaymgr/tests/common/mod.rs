// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fakes: an in-memory package manager and an installer that writes
//! idmap headers into a temporary resource cache.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use overlaymgr::{
    idmap_file_name, ApplicationInfo, ChangeEvent, IdmapHeader, IdmapManager, Installer,
    InstallerError, OverlayDatabase, OverlayManagerService, PackageInfo, PackageManagerHelper,
    FLAG_SYSTEM,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const TARGET: &str = "com.example.app";
pub const TARGET_UID: u32 = 10_042;

#[derive(Clone, Default)]
pub struct FakePackages {
    packages: Arc<Mutex<BTreeMap<(String, i32), PackageInfo>>>,
}

impl FakePackages {
    pub fn install(&self, user_id: i32, info: PackageInfo) {
        self.packages.lock().insert((info.package_name.clone(), user_id), info);
    }

    pub fn uninstall(&self, package_name: &str, user_id: i32) {
        self.packages.lock().remove(&(package_name.to_string(), user_id));
    }
}

impl PackageManagerHelper for FakePackages {
    fn get_package_info(&self, package_name: &str, user_id: i32) -> Option<PackageInfo> {
        self.packages.lock().get(&(package_name.to_string(), user_id)).cloned()
    }

    fn signatures_matching(&self, _package_name1: &str, _package_name2: &str, _user_id: i32) -> bool {
        false
    }

    fn get_overlay_packages(&self, user_id: i32) -> Vec<PackageInfo> {
        self.packages
            .lock()
            .iter()
            .filter(|((_, user), info)| *user == user_id && info.is_overlay())
            .map(|(_, info)| info.clone())
            .collect()
    }
}

/// Writes a header-only idmap for every request.
#[derive(Clone)]
pub struct FakeInstaller {
    cache_dir: PathBuf,
    dangerous: Arc<Mutex<BTreeSet<String>>>,
    failing: Arc<AtomicBool>,
    pub gids: Arc<Mutex<Vec<Option<u32>>>>,
    pub removed: Arc<Mutex<Vec<String>>>,
}

impl FakeInstaller {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            dangerous: Arc::default(),
            failing: Arc::default(),
            gids: Arc::default(),
            removed: Arc::default(),
        }
    }

    /// Idmaps generated for `overlay_path` from now on carry the dangerous flag.
    pub fn mark_dangerous(&self, overlay_path: &str) {
        self.dangerous.lock().insert(overlay_path.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Installer for FakeInstaller {
    fn idmap(
        &self,
        _target_path: &str,
        overlay_path: &str,
        shared_gid: Option<u32>,
    ) -> Result<(), InstallerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(InstallerError::Status(1));
        }
        self.gids.lock().push(shared_gid);
        let header = IdmapHeader::new(self.dangerous.lock().contains(overlay_path));
        fs::write(self.cache_dir.join(idmap_file_name(overlay_path)), header.to_bytes())
            .map_err(|err| InstallerError::Unavailable(err.to_string()))
    }

    fn remove_idmap(&self, base_code_path: &str) -> Result<(), InstallerError> {
        self.removed.lock().push(base_code_path.to_string());
        fs::remove_file(self.cache_dir.join(idmap_file_name(base_code_path)))
            .map_err(|err| InstallerError::Unavailable(err.to_string()))
    }
}

pub fn target_package(name: &str, uid: u32) -> PackageInfo {
    PackageInfo {
        package_name: name.to_string(),
        overlay_target: None,
        application_info: ApplicationInfo {
            enabled: true,
            flags: 0,
            base_code_path: format!("/data/app/{name}/base.apk"),
            uid,
        },
    }
}

pub fn overlay_package(name: &str, target: &str) -> PackageInfo {
    PackageInfo {
        package_name: name.to_string(),
        overlay_target: Some(target.to_string()),
        application_info: ApplicationInfo {
            enabled: true,
            flags: 0,
            base_code_path: format!("/data/app/{name}/base.apk"),
            uid: 10_100,
        },
    }
}

pub fn system_overlay_package(name: &str, target: &str) -> PackageInfo {
    let mut info = overlay_package(name, target);
    info.application_info.flags |= FLAG_SYSTEM;
    info.application_info.base_code_path = format!("/vendor/overlay/{name}.apk");
    info
}

pub fn base_path(name: &str) -> String {
    format!("/data/app/{name}/base.apk")
}

pub struct Fixture {
    pub dir: TempDir,
    pub cache_dir: PathBuf,
    pub packages: FakePackages,
    pub installer: FakeInstaller,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("resource-cache");
        fs::create_dir_all(&cache_dir).unwrap();
        let installer = FakeInstaller::new(&cache_dir);
        Self { dir, cache_dir, packages: FakePackages::default(), installer }
    }

    pub fn service(&self) -> OverlayManagerService<FakePackages, FakeInstaller> {
        OverlayManagerService::new(
            self.packages.clone(),
            IdmapManager::with_cache_dir(self.installer.clone(), &self.cache_dir),
            OverlayDatabase::new(),
        )
    }

    pub fn idmap_path(&self, overlay_path: &str) -> PathBuf {
        self.cache_dir.join(idmap_file_name(overlay_path))
    }
}

pub fn record(
    service: &mut OverlayManagerService<FakePackages, FakeInstaller>,
) -> Arc<Mutex<Vec<ChangeEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    service.database_mut().add_change_listener(move |event| sink.lock().push(event.clone()));
    events
}
