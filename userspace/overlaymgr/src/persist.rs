// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! XML form of the overlay table.
//!
//! ```text
//! <overlays version="1">
//!     <row packageName=".." userId="0" targetPackageName=".." baseCodePath=".."
//!          state="4" isEnabled="false" isUpgrading="false" />
//! </overlays>
//! ```
//!
//! Rows are written in table order, so priority survives a round trip.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::database::OverlayRow;
use crate::info::OverlayState;

/// Schema version written to and required from the document.
pub const CURRENT_VERSION: i32 = 1;

const TAG_OVERLAYS: &str = "overlays";
const TAG_ROW: &str = "row";

const ATTR_BASE_CODE_PATH: &str = "baseCodePath";
const ATTR_IS_ENABLED: &str = "isEnabled";
const ATTR_IS_UPGRADING: &str = "isUpgrading";
const ATTR_PACKAGE_NAME: &str = "packageName";
const ATTR_STATE: &str = "state";
const ATTR_TARGET_PACKAGE_NAME: &str = "targetPackageName";
const ATTR_USER_ID: &str = "userId";
const ATTR_VERSION: &str = "version";

/// Errors raised while reading or writing the table document.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Underlying reader or writer failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The document is not well-formed XML.
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    /// The document carries a schema version other than [`CURRENT_VERSION`].
    #[error("unrecognized version {0}")]
    UnsupportedVersion(String),
    /// The document element is not `<overlays>`.
    #[error("expected <{expected}>, found <{found}>")]
    UnexpectedElement {
        /// Element that was required.
        expected: &'static str,
        /// Element that was found.
        found: String,
    },
    /// The document has no root element.
    #[error("document has no root element")]
    MissingRoot,
    /// The document ended before `</overlays>`.
    #[error("document ended inside <overlays>")]
    Truncated,
    /// A required attribute is absent.
    #[error("missing attribute `{0}`")]
    MissingAttribute(&'static str),
    /// An attribute could not be decoded.
    #[error("invalid value {value:?} for attribute `{name}`")]
    InvalidAttribute {
        /// Attribute name.
        name: &'static str,
        /// Raw attribute value.
        value: String,
    },
    /// Two rows share a (package, user) key.
    #[error("duplicate row {package_name}:{user_id}")]
    DuplicateRow {
        /// Overlay package of the repeated key.
        package_name: String,
        /// User of the repeated key.
        user_id: i32,
    },
}

pub(crate) fn write_table<W: Write>(table: &[OverlayRow], writer: W) -> Result<(), PersistError> {
    let mut xml = Writer::new_with_indent(writer, b' ', 4);
    xml.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;

    let mut root = BytesStart::new(TAG_OVERLAYS);
    let version = CURRENT_VERSION.to_string();
    root.push_attribute((ATTR_VERSION, version.as_str()));
    xml.write_event(Event::Start(root))?;

    for row in table {
        let user_id = row.user_id.to_string();
        let state = row.state().as_i32().to_string();
        let mut element = BytesStart::new(TAG_ROW);
        element.push_attribute((ATTR_PACKAGE_NAME, row.package_name.as_str()));
        element.push_attribute((ATTR_USER_ID, user_id.as_str()));
        element.push_attribute((ATTR_TARGET_PACKAGE_NAME, row.target_package_name.as_str()));
        element.push_attribute((ATTR_BASE_CODE_PATH, row.base_code_path()));
        element.push_attribute((ATTR_STATE, state.as_str()));
        element.push_attribute((ATTR_IS_ENABLED, bool_str(row.is_enabled())));
        element.push_attribute((ATTR_IS_UPGRADING, bool_str(row.is_upgrading())));
        xml.write_event(Event::Empty(element))?;
    }

    xml.write_event(Event::End(BytesEnd::new(TAG_OVERLAYS)))?;
    let mut out = xml.into_inner();
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

pub(crate) fn read_table<R: BufRead>(reader: R) -> Result<Vec<OverlayRow>, PersistError> {
    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut in_root = false;
    // Nesting below the document element.
    let mut depth = 0usize;

    loop {
        match xml.read_event_into(&mut buf)? {
            Event::Start(element) => {
                if !in_root {
                    check_root(&element)?;
                    in_root = true;
                } else {
                    if depth == 0 {
                        collect_row(&element, &mut rows)?;
                    }
                    depth += 1;
                }
            }
            Event::Empty(element) => {
                if !in_root {
                    check_root(&element)?;
                    return Ok(rows);
                }
                if depth == 0 {
                    collect_row(&element, &mut rows)?;
                }
            }
            Event::End(_) => {
                if depth == 0 {
                    return Ok(rows);
                }
                depth -= 1;
            }
            Event::Eof => {
                return Err(if in_root { PersistError::Truncated } else { PersistError::MissingRoot });
            }
            _ => {}
        }
        buf.clear();
    }
}

fn check_root(element: &BytesStart<'_>) -> Result<(), PersistError> {
    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    if name != TAG_OVERLAYS {
        return Err(PersistError::UnexpectedElement { expected: TAG_OVERLAYS, found: name });
    }
    let attrs = attributes(element)?;
    let version = attrs.get(ATTR_VERSION).ok_or(PersistError::MissingAttribute(ATTR_VERSION))?;
    match version.trim().parse::<i32>() {
        Ok(CURRENT_VERSION) => Ok(()),
        _ => Err(PersistError::UnsupportedVersion(version.clone())),
    }
}

fn collect_row(element: &BytesStart<'_>, rows: &mut Vec<OverlayRow>) -> Result<(), PersistError> {
    if element.name().as_ref() != TAG_ROW.as_bytes() {
        return Ok(());
    }
    let row = parse_row(element)?;
    if rows.iter().any(|existing| {
        existing.user_id == row.user_id && existing.package_name == row.package_name
    }) {
        return Err(PersistError::DuplicateRow {
            package_name: row.package_name,
            user_id: row.user_id,
        });
    }
    rows.push(row);
    Ok(())
}

fn parse_row(element: &BytesStart<'_>) -> Result<OverlayRow, PersistError> {
    let mut attrs = attributes(element)?;
    let mut take = |name: &'static str| attrs.remove(name).ok_or(PersistError::MissingAttribute(name));

    let package_name = take(ATTR_PACKAGE_NAME)?;
    let user_id = parse_int(ATTR_USER_ID, take(ATTR_USER_ID)?)?;
    let target_package_name = take(ATTR_TARGET_PACKAGE_NAME)?;
    let base_code_path = take(ATTR_BASE_CODE_PATH)?;
    let raw_state = take(ATTR_STATE)?;
    let state = OverlayState::from_i32(parse_int(ATTR_STATE, raw_state.clone())?)
        .ok_or(PersistError::InvalidAttribute { name: ATTR_STATE, value: raw_state })?;
    let enabled = parse_bool(ATTR_IS_ENABLED, take(ATTR_IS_ENABLED)?)?;
    let upgrading = parse_bool(ATTR_IS_UPGRADING, take(ATTR_IS_UPGRADING)?)?;

    Ok(OverlayRow::restored(
        package_name,
        user_id,
        target_package_name,
        base_code_path,
        state,
        enabled,
        upgrading,
    ))
}

fn attributes(element: &BytesStart<'_>) -> Result<BTreeMap<String, String>, PersistError> {
    let mut out = BTreeMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn parse_int(name: &'static str, value: String) -> Result<i32, PersistError> {
    value.trim().parse().map_err(|_| PersistError::InvalidAttribute { name, value })
}

fn parse_bool(name: &'static str, value: String) -> Result<bool, PersistError> {
    match value.as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(PersistError::InvalidAttribute { name, value }),
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use crate::database::OverlayDatabase;
    use crate::info::OverlayState;

    use super::PersistError;

    const DOC: &str = r#"<?xml version='1.0' encoding='utf-8' standalone='yes' ?>
<overlays version="1">
    <row packageName="com.overlay.red" userId="0" targetPackageName="com.target.app"
         baseCodePath="/data/app/red/base.apk" state="5" isEnabled="true" isUpgrading="false" />
    <row packageName="com.overlay.blue" userId="0" targetPackageName="com.target.app"
         baseCodePath="/data/app/blue/base.apk" state="4" isEnabled="false" isUpgrading="false" />
    <row packageName="com.overlay.green" userId="10" targetPackageName="com.target.app"
         baseCodePath="/data/app/green/base.apk" state="-1" isEnabled="false" isUpgrading="true" />
</overlays>
"#;

    #[test]
    fn restore_reads_rows_in_order() {
        let mut db = OverlayDatabase::new();
        db.restore(DOC.as_bytes()).unwrap();

        let names: Vec<_> = db
            .overlays_for_target("com.target.app", 0)
            .into_iter()
            .map(|info| (info.package_name, info.state))
            .collect();
        assert_eq!(
            names,
            vec![
                ("com.overlay.red".to_string(), OverlayState::ApprovedEnabled),
                ("com.overlay.blue".to_string(), OverlayState::ApprovedDisabled),
            ]
        );
        assert!(db.enabled("com.overlay.red", 0).unwrap());
        assert!(db.upgrading("com.overlay.green", 10).unwrap());
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn persisted_document_restores_identically() {
        let mut db = OverlayDatabase::new();
        db.restore(DOC.as_bytes()).unwrap();

        let mut out = Vec::new();
        db.persist(&mut out).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.contains(r#"<overlays version="1">"#));
        assert!(text.contains(r#"isUpgrading="true""#));

        let mut again = OverlayDatabase::new();
        again.restore(out.as_slice()).unwrap();
        let mut first = String::new();
        let mut second = String::new();
        db.dump(&mut first).unwrap();
        again.dump(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn special_characters_are_escaped() {
        let mut db = OverlayDatabase::new();
        db.init("com.overlay.q", 0, "com.target.app", "/data/app/a&b \"c\"/base.apk");
        let mut out = Vec::new();
        db.persist(&mut out).unwrap();

        let mut again = OverlayDatabase::new();
        again.restore(out.as_slice()).unwrap();
        assert_eq!(
            again.base_code_path("com.overlay.q", 0).unwrap(),
            "/data/app/a&b \"c\"/base.apk"
        );
    }

    #[test]
    fn version_mismatch_is_rejected_and_leaves_table_empty() {
        let mut db = OverlayDatabase::new();
        db.init("com.overlay.keep", 0, "com.target.app", "/k");
        let doc = DOC.replace(r#"version="1""#, r#"version="2""#);
        let err = db.restore(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, PersistError::UnsupportedVersion(ref v) if v == "2"));
        assert!(db.is_empty());
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let mut db = OverlayDatabase::new();

        let bad_state = DOC.replace(r#"state="4""#, r#"state="9""#);
        assert!(matches!(
            db.restore(bad_state.as_bytes()),
            Err(PersistError::InvalidAttribute { name: "state", .. })
        ));

        let bad_bool = DOC.replace(r#"isEnabled="true""#, r#"isEnabled="yes""#);
        assert!(matches!(
            db.restore(bad_bool.as_bytes()),
            Err(PersistError::InvalidAttribute { name: "isEnabled", .. })
        ));

        let missing = DOC.replace(r#" userId="10""#, "");
        assert!(matches!(
            db.restore(missing.as_bytes()),
            Err(PersistError::MissingAttribute("userId"))
        ));

        let duplicate = DOC.replace("com.overlay.blue", "com.overlay.red");
        assert!(matches!(db.restore(duplicate.as_bytes()), Err(PersistError::DuplicateRow { .. })));

        assert!(matches!(
            db.restore(&b"<settings version=\"1\"/>"[..]),
            Err(PersistError::UnexpectedElement { .. })
        ));
        assert!(matches!(db.restore(&b""[..]), Err(PersistError::MissingRoot)));
        assert!(db.is_empty());
    }

    #[test]
    fn empty_document_restores_empty_table() {
        let mut db = OverlayDatabase::new();
        db.restore(&b"<overlays version=\"1\" />"[..]).unwrap();
        assert!(db.is_empty());
    }
}
