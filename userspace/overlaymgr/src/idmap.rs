// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Idmap artifact lifecycle for overlay packages
//! INTENT: Create/remove idmaps through the installer, locate them on disk, read the header
//! DEPS: std::fs (header reads), log
//! INVARIANTS: One idmap per overlay base code path, shared by every user;
//!             unreadable headers are reported as dangerous

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

use crate::info::OverlayInfo;
use crate::package::PackageInfo;

/// Directory holding idmap files unless configured otherwise.
pub const DEFAULT_RESOURCE_CACHE_DIR: &str = "/data/resource-cache";

/// Magic number at the start of an idmap file (`IDMP`).
pub const IDMAP_MAGIC: u32 = 0x504D_4449;

/// Header version written by [`IdmapHeader::new`].
pub const IDMAP_VERSION: u32 = 1;

const PER_USER_RANGE: u32 = 100_000;
const FIRST_APPLICATION_UID: u32 = 10_000;
const LAST_APPLICATION_UID: u32 = 19_999;
const FIRST_SHARED_APPLICATION_GID: u32 = 50_000;

/// Failure reported by the installer collaborator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstallerError {
    /// The installer ran and returned a non-zero status.
    #[error("installer returned status {0}")]
    Status(i32),
    /// The installer could not be reached.
    #[error("installer unavailable: {0}")]
    Unavailable(String),
}

/// Privileged helper that materialises idmap files.
pub trait Installer {
    /// Computes the idmap between the target and overlay artifacts.
    fn idmap(
        &self,
        target_path: &str,
        overlay_path: &str,
        shared_gid: Option<u32>,
    ) -> Result<(), InstallerError>;

    /// Deletes the idmap belonging to the overlay at `base_code_path`.
    fn remove_idmap(&self, base_code_path: &str) -> Result<(), InstallerError>;
}

/// File name of the idmap for an overlay installed at `base_code_path`.
///
/// The leading `/` is dropped and every remaining `/` becomes `@`. Other tools
/// compute the same name, so the mapping must stay bit-exact.
pub fn idmap_file_name(base_code_path: &str) -> String {
    let relative = base_code_path.strip_prefix('/').unwrap_or(base_code_path);
    let mut name = relative.replace('/', "@");
    name.push_str("@idmap");
    name
}

/// Shared group id for packages running as `uid`, if it has one.
pub fn shared_app_gid(uid: u32) -> Option<u32> {
    let app_id = uid % PER_USER_RANGE;
    if (FIRST_APPLICATION_UID..=LAST_APPLICATION_UID).contains(&app_id) {
        Some(app_id - FIRST_APPLICATION_UID + FIRST_SHARED_APPLICATION_GID)
    } else if app_id < FIRST_APPLICATION_UID {
        Some(app_id)
    } else {
        None
    }
}

/// Fixed header at the start of every idmap file: three big-endian `u32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdmapHeader {
    /// File magic.
    pub magic: u32,
    /// Format version.
    pub version: u32,
    /// Non-zero when the overlay touches resources it was not granted.
    pub dangerous: u32,
}

impl IdmapHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;

    /// Builds a header with the current magic and version.
    pub fn new(dangerous: bool) -> Self {
        Self { magic: IDMAP_MAGIC, version: IDMAP_VERSION, dangerous: u32::from(dangerous) }
    }

    /// Reads the header from the start of `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut raw = [0u8; Self::SIZE];
        reader.read_exact(&mut raw)?;
        let word = |at: usize| u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Ok(Self { magic: word(0), version: word(4), dangerous: word(8) })
    }

    /// Big-endian encoding.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..12].copy_from_slice(&self.dangerous.to_be_bytes());
        out
    }

    /// Whether the dangerous flag is set.
    pub fn is_dangerous(&self) -> bool {
        self.dangerous != 0
    }
}

/// Reads the idmap at `path` and reports its dangerous flag.
///
/// Missing, short or unreadable files count as dangerous.
pub fn is_idmap_dangerous(path: &Path) -> bool {
    let header = File::open(path).and_then(|mut file| IdmapHeader::read_from(&mut file));
    match header {
        Ok(header) => header.is_dangerous(),
        Err(err) => {
            debug!("idmap {} unreadable, treating as dangerous: {err}", path.display());
            true
        }
    }
}

/// Installer-backed idmap operations for overlay packages.
pub struct IdmapManager<I> {
    installer: I,
    cache_dir: PathBuf,
}

impl<I: Installer> IdmapManager<I> {
    /// Uses [`DEFAULT_RESOURCE_CACHE_DIR`] as the idmap directory.
    pub fn new(installer: I) -> Self {
        Self::with_cache_dir(installer, DEFAULT_RESOURCE_CACHE_DIR)
    }

    /// Uses `cache_dir` as the idmap directory.
    pub fn with_cache_dir(installer: I, cache_dir: impl Into<PathBuf>) -> Self {
        Self { installer, cache_dir: cache_dir.into() }
    }

    /// The wrapped installer.
    pub fn installer(&self) -> &I {
        &self.installer
    }

    /// Directory idmap files are expected in.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Location of the idmap for an overlay installed at `base_code_path`.
    pub fn idmap_path(&self, base_code_path: &str) -> PathBuf {
        self.cache_dir.join(idmap_file_name(base_code_path))
    }

    /// Asks the installer to build the idmap for `overlay` against `target`.
    ///
    /// Returns `false` when the installer fails; the failure is only logged.
    pub fn create_idmap(&self, target: &PackageInfo, overlay: &PackageInfo, user_id: i32) -> bool {
        let shared_gid = shared_app_gid(target.application_info.uid);
        let target_path = target.base_code_path();
        let overlay_path = overlay.base_code_path();
        debug!(
            "create idmap for {} and {} in user {user_id}",
            target.package_name, overlay.package_name
        );
        match self.installer.idmap(target_path, overlay_path, shared_gid) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "failed to generate idmap for {target_path} and {overlay_path}: {err}"
                );
                false
            }
        }
    }

    /// Asks the installer to delete the idmap belonging to `info`.
    pub fn remove_idmap(&self, info: &OverlayInfo, user_id: i32) -> bool {
        debug!("remove idmap for {} in user {user_id}", info.base_code_path);
        match self.installer.remove_idmap(&info.base_code_path) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to remove idmap for {}: {err}", info.base_code_path);
                false
            }
        }
    }

    /// Whether the idmap for `info` is present on disk.
    pub fn idmap_exists(&self, info: &OverlayInfo) -> bool {
        self.idmap_path(&info.base_code_path).is_file()
    }

    /// Whether the idmap for an installed overlay package is present on disk.
    pub fn idmap_exists_for_package(&self, overlay: &PackageInfo, _user_id: i32) -> bool {
        self.idmap_path(overlay.base_code_path()).is_file()
    }

    /// Reads the dangerous flag from the overlay's idmap, failing closed.
    pub fn is_dangerous(&self, overlay: &PackageInfo, _user_id: i32) -> bool {
        is_idmap_dangerous(&self.idmap_path(overlay.base_code_path()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::OverlayState;
    use crate::package::ApplicationInfo;
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingInstaller {
        calls: RefCell<Vec<String>>,
        fail: bool,
    }

    impl Installer for RecordingInstaller {
        fn idmap(
            &self,
            target_path: &str,
            overlay_path: &str,
            shared_gid: Option<u32>,
        ) -> Result<(), InstallerError> {
            self.calls.borrow_mut().push(format!("idmap {target_path} {overlay_path} {shared_gid:?}"));
            if self.fail {
                Err(InstallerError::Status(-1))
            } else {
                Ok(())
            }
        }

        fn remove_idmap(&self, base_code_path: &str) -> Result<(), InstallerError> {
            self.calls.borrow_mut().push(format!("rm {base_code_path}"));
            if self.fail {
                Err(InstallerError::Unavailable("down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn package(name: &str, path: &str, uid: u32) -> PackageInfo {
        PackageInfo {
            package_name: name.into(),
            overlay_target: None,
            application_info: ApplicationInfo {
                enabled: true,
                flags: 0,
                base_code_path: path.into(),
                uid,
            },
        }
    }

    #[test]
    fn idmap_path_matches_resource_cache_layout() {
        let manager = IdmapManager::new(RecordingInstaller::default());
        let path = manager.idmap_path("/data/app/com.foo-1/base.apk");
        assert_eq!(
            path.to_str(),
            Some("/data/resource-cache/data@app@com.foo-1@base.apk@idmap")
        );
        assert_eq!(idmap_file_name("/vendor/overlay/x.apk"), "vendor@overlay@x.apk@idmap");
    }

    #[test]
    fn shared_gid_ranges() {
        assert_eq!(shared_app_gid(10_057), Some(50_057));
        assert_eq!(shared_app_gid(1_010_057), Some(50_057));
        assert_eq!(shared_app_gid(1_000), Some(1_000));
        assert_eq!(shared_app_gid(99_000), None);
    }

    #[test]
    fn create_idmap_passes_target_gid_and_absorbs_failure() {
        let target = package("com.target.app", "/data/app/target/base.apk", 10_020);
        let overlay = package("com.overlay.blue", "/data/app/blue/base.apk", 10_030);

        let manager = IdmapManager::new(RecordingInstaller::default());
        assert!(manager.create_idmap(&target, &overlay, 0));
        assert_eq!(
            manager.installer().calls.borrow().as_slice(),
            ["idmap /data/app/target/base.apk /data/app/blue/base.apk Some(50020)"]
        );

        let failing = IdmapManager::new(RecordingInstaller { fail: true, ..Default::default() });
        assert!(!failing.create_idmap(&target, &overlay, 0));
        let info = OverlayInfo {
            package_name: overlay.package_name.clone(),
            target_package_name: target.package_name.clone(),
            base_code_path: overlay.base_code_path().into(),
            state: OverlayState::ApprovedEnabled,
            user_id: 0,
        };
        assert!(!failing.remove_idmap(&info, 0));
    }

    #[test]
    fn dangerous_flag_is_read_from_header() {
        let dir = TempDir::new().unwrap();
        let manager = IdmapManager::with_cache_dir(RecordingInstaller::default(), dir.path());
        let safe = package("com.overlay.safe", "/data/app/safe/base.apk", 10_001);
        let risky = package("com.overlay.risky", "/data/app/risky/base.apk", 10_002);

        std::fs::write(manager.idmap_path(safe.base_code_path()), IdmapHeader::new(false).to_bytes())
            .unwrap();
        std::fs::write(manager.idmap_path(risky.base_code_path()), IdmapHeader::new(true).to_bytes())
            .unwrap();

        assert!(manager.idmap_exists_for_package(&safe, 0));
        assert!(!manager.is_dangerous(&safe, 0));
        assert!(manager.is_dangerous(&risky, 0));
    }

    #[test]
    fn unreadable_idmap_is_dangerous() {
        let dir = TempDir::new().unwrap();
        let manager = IdmapManager::with_cache_dir(RecordingInstaller::default(), dir.path());
        let missing = package("com.overlay.missing", "/data/app/missing/base.apk", 10_003);
        assert!(!manager.idmap_exists_for_package(&missing, 0));
        assert!(manager.is_dangerous(&missing, 0));

        let short = package("com.overlay.short", "/data/app/short/base.apk", 10_004);
        std::fs::write(manager.idmap_path(short.base_code_path()), [0u8; 8]).unwrap();
        assert!(manager.is_dangerous(&short, 0));
    }
}
