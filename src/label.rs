//! Volume-label detection and write-back.
//!
//! The boot-menu config references the volume by `LABEL=` tokens, so
//! the filesystem label and those references have to agree. Spaces in
//! the tokens are escaped as `\x20`.

use std::path::Path;

use log::{info, warn};

use crate::{
    backend::Backend,
    ops,
    session::{MountName, Session},
    types::Error,
};

const CONFIG_CANDIDATES: &[&str] = &[
    "/dest/syslinux/syslinux.cfg",
    "/dest/isolinux/isolinux.cfg",
];

const LABEL_MARKER: &str = "LABEL=";
const SPACE_ESCAPE: &str = "\\x20";

/// FAT volume labels are limited to 11 characters.
const FAT_LABEL_MAX: usize = 11;

fn escape(label: &str) -> String {
    label.replace(' ', SPACE_ESCAPE)
}

fn unescape(token: &str) -> String {
    token.replace(SPACE_ESCAPE, " ")
}

fn boot_config<B: Backend>(session: &mut Session<B>) -> Result<Option<&'static str>, Error> {
    session.mount(MountName::Dest)?;

    for candidate in CONFIG_CANDIDATES {
        if session.backend.is_file(Path::new(candidate))? {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

/// Scans the boot-menu config for `LABEL=` tokens and returns the
/// label to adopt: the single distinct one found, or none when there
/// are zero or several.
pub(crate) fn detect_label<B: Backend>(session: &mut Session<B>) -> Result<Option<String>, Error> {
    let Some(config) = boot_config(session)? else {
        warn!("No boot-menu config found, can't detect a volume label");
        return Ok(None);
    };

    let text = session.backend.read_text(Path::new(config))?;

    let mut labels = Vec::new();
    for line in text.lines() {
        for token in line.split_whitespace() {
            let Some((_, raw)) = token.split_once(LABEL_MARKER) else {
                continue;
            };

            let label = unescape(raw);
            if !label.is_empty() && !labels.contains(&label) {
                labels.push(label);
            }
        }
    }

    match labels.as_slice() {
        [] => {
            warn!("No {LABEL_MARKER} references in {config}");
            Ok(None)
        }
        [label] => {
            info!("Detected volume label {label:?} in {config}");
            Ok(Some(label.clone()))
        }
        several => {
            warn!("Several labels referenced in {config}, pick one with --label:");
            for label in several {
                warn!("  {label:?}");
            }
            Ok(None)
        }
    }
}

/// Writes the volume label to the destination partition, detecting it
/// from the boot-menu config when `requested` is absent or `"auto"`.
///
/// A label too long for a FAT filesystem is truncated; with
/// `patch_config` the boot-menu references are rewritten to the
/// truncated form, otherwise the mismatch is reported.
pub(crate) fn update_label<B: Backend>(
    session: &mut Session<B>,
    requested: Option<&str>,
    patch_config: bool,
) -> Result<(), Error> {
    let label = match requested {
        Some(label) if label != "auto" => Some(label.to_owned()),
        Some(_) | None => detect_label(session)?,
    };

    let Some(label) = label else {
        warn!("No volume label to set");
        return Ok(());
    };

    let written = if session.fs().is_fat() && label.chars().count() > FAT_LABEL_MAX {
        let truncated = label.chars().take(FAT_LABEL_MAX).collect::<String>();
        warn!("Truncating volume label {label:?} to {truncated:?}");
        truncated
    } else {
        label.clone()
    };

    let partition = session.dest_partition()?.to_owned();
    session.backend.set_filesystem_label(&partition, &written)?;

    if written != label {
        if patch_config {
            if let Some(config) = boot_config(session)? {
                let find = format!("{LABEL_MARKER}{}", escape(&label));
                let replace = format!("{LABEL_MARKER}{}", escape(&written));

                ops::patch_file(
                    session,
                    Path::new(config),
                    &regex::escape(&find),
                    &find,
                    &replace,
                )?;
            } else {
                warn!("No boot-menu config to patch the truncated label into");
            }
        } else {
            warn!(
                "The on-disk label {written:?} and the boot-menu {LABEL_MARKER} references now disagree"
            );
        }
    }

    let actual = session.backend.filesystem_label(&partition)?;
    println!("Volume label: {actual}");

    Ok(())
}
