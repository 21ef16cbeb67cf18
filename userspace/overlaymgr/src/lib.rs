// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Runtime resource overlay manager
//! INTENT: Decide which overlay packages apply to which targets, per user
//! DEPS: quick-xml (state file), toml/serde (config), parking_lot (facade lock), log
//! READINESS: Host library; package manager and installer are injected
//! TESTS: Unit tests per module; lifecycle flows and CLI under tests/
#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cli;
pub mod config;
pub mod database;
pub mod idmap;
pub mod info;
pub mod manager;
pub mod package;
mod persist;
pub mod service;

pub use cli::{execute, help, run};
pub use config::{ConfigError, OverlayConfig};
pub use database::{ChangeEvent, DatabaseError, ListenerId, OverlayDatabase};
pub use idmap::{
    idmap_file_name, is_idmap_dangerous, shared_app_gid, IdmapHeader, IdmapManager, Installer,
    InstallerError,
};
pub use info::{OverlayInfo, OverlayState};
pub use manager::{ManagerError, OverlayManager};
pub use package::{ApplicationInfo, PackageInfo, PackageManagerHelper, FLAG_SYSTEM};
/// Errors raised while reading or writing the overlay state file.
pub use persist::{PersistError, CURRENT_VERSION};
pub use service::{decide_state, OverlayManagerService, StateInputs};
