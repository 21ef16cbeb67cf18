// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-side inspection commands for idmaps and overlay state files.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::database::OverlayDatabase;
use crate::idmap::{idmap_file_name, is_idmap_dangerous, DEFAULT_RESOURCE_CACHE_DIR};

/// Returns the CLI usage string.
pub fn help() -> &'static str {
    "overlayctl inspects overlay state. Usage: overlayctl \
     <idmap-path <base-code-path> [--cache-dir DIR] | dangerous <idmap-file> | dump <state.xml>>"
}

/// Executes one command and returns what it prints.
pub fn execute(args: &[&str]) -> String {
    if args.is_empty() || args.iter().any(|arg| *arg == "--help") {
        return help().to_string();
    }

    match args[0] {
        "idmap-path" => match args.get(1) {
            Some(base) => idmap_path(base, &args[2..]),
            None => "missing base code path".to_string(),
        },
        "dangerous" => match args.get(1) {
            Some(path) => {
                if is_idmap_dangerous(Path::new(path)) {
                    "dangerous".to_string()
                } else {
                    "safe".to_string()
                }
            }
            None => "missing idmap file".to_string(),
        },
        "dump" => match args.get(1) {
            Some(path) => dump(Path::new(path)),
            None => "missing state file".to_string(),
        },
        other => format!("unknown command {other}"),
    }
}

fn idmap_path(base: &str, rest: &[&str]) -> String {
    let cache_dir = match rest {
        [] => PathBuf::from(DEFAULT_RESOURCE_CACHE_DIR),
        ["--cache-dir", dir] => PathBuf::from(dir),
        ["--cache-dir"] => return "missing value for --cache-dir".to_string(),
        [other, ..] => return format!("unexpected argument {other}"),
    };
    cache_dir.join(idmap_file_name(base)).display().to_string()
}

fn dump(path: &Path) -> String {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => return format!("restore failed: {err}"),
    };
    let mut database = OverlayDatabase::new();
    if let Err(err) = database.restore(BufReader::new(file)) {
        return format!("restore failed: {err}");
    }
    let mut out = String::new();
    match database.dump(&mut out) {
        Ok(()) => out.trim_end().to_string(),
        Err(err) => format!("dump failed: {err}"),
    }
}

/// Parses `std::env::args` and prints the execution result.
pub fn run() {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    println!("{}", execute(&refs));
}

#[cfg(test)]
mod tests {
    use super::{execute, help};

    #[test]
    fn help_contains_name() {
        assert!(help().contains("overlayctl"));
        assert_eq!(execute(&[]), help());
    }

    #[test]
    fn idmap_path_defaults_to_resource_cache() {
        assert_eq!(
            execute(&["idmap-path", "/vendor/overlay/Foo.apk"]),
            "/data/resource-cache/vendor@overlay@Foo.apk@idmap"
        );
    }

    #[test]
    fn idmap_path_honours_cache_dir() {
        assert_eq!(
            execute(&["idmap-path", "/data/app/Bar.apk", "--cache-dir", "/tmp/rc"]),
            "/tmp/rc/data@app@Bar.apk@idmap"
        );
        assert!(execute(&["idmap-path", "/a.apk", "--cache-dir"]).contains("missing value"));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(execute(&["frobnicate"]), "unknown command frobnicate");
    }
}
