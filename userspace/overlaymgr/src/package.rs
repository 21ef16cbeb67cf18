// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Installed-package view consumed by the overlay manager.

/// Application flag marking a package installed on the system partition.
pub const FLAG_SYSTEM: u32 = 1 << 0;

/// Application-level attributes of an installed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    /// Component enabled state as reported by the package manager.
    pub enabled: bool,
    /// Bitmask of `FLAG_*` values.
    pub flags: u32,
    /// Path of the installed artifact.
    pub base_code_path: String,
    /// Kernel uid assigned to the package.
    pub uid: u32,
}

impl ApplicationInfo {
    /// True when the package lives on the system partition.
    pub fn is_system(&self) -> bool {
        self.flags & FLAG_SYSTEM != 0
    }
}

/// Installed package as seen for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    /// Package identifier.
    pub package_name: String,
    /// Target package when this package is an overlay.
    pub overlay_target: Option<String>,
    /// Application attributes.
    pub application_info: ApplicationInfo,
}

impl PackageInfo {
    /// Shorthand for the installed artifact path.
    pub fn base_code_path(&self) -> &str {
        &self.application_info.base_code_path
    }

    /// True when the package declares an overlay target.
    pub fn is_overlay(&self) -> bool {
        self.overlay_target.is_some()
    }
}

/// Package lookup collaborator injected into the service.
pub trait PackageManagerHelper {
    /// Returns the package installed as `package_name` for `user_id`.
    fn get_package_info(&self, package_name: &str, user_id: i32) -> Option<PackageInfo>;

    /// Whether both packages are signed with the same certificates.
    fn signatures_matching(&self, package_name1: &str, package_name2: &str, user_id: i32) -> bool;

    /// Every overlay package installed for `user_id`.
    fn get_overlay_packages(&self, user_id: i32) -> Vec<PackageInfo>;
}
