//! File and patch operations against the mounted session filesystems.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use regex::Regex;

use crate::{
    backend::Backend,
    session::{MountName, Session},
    types::Error,
};

/// Copies the source image file itself into the destination root.
pub(crate) const ISO_FILE: &str = ":isofile";

/// Stages the source's installer-boot directory as the destination's
/// boot directory.
pub(crate) const ISOLINUX_AS_SYSLINUX: &str = ":isolinux-as-syslinux";

const SOURCE_BOOT_STAGING: &str = "isolinux";
const DEST_BOOT_DIR: &str = "syslinux";

/// What [`patch_file`] did with the target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PatchOutcome {
    /// No line matched the pattern; nothing written.
    NoMatch,

    /// At least one line matched, the replacement changed nothing;
    /// nothing written.
    Unchanged,

    /// The file was rewritten.
    Written,
}

fn dest_path(dest_subdir: &str, name: &str) -> PathBuf {
    let mut path = PathBuf::from("/dest");
    if !dest_subdir.is_empty() {
        path.push(dest_subdir);
    }
    path.push(name);
    path
}

fn base_name(path: &Path) -> Result<String, Error> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Custom(format!("{} has no file name", path.display())))
}

/// Copies a host-resident file to `destSubdir/basename` on the
/// destination.
pub(crate) fn upload_file<B: Backend>(
    session: &mut Session<B>,
    host_path: &Path,
    dest_subdir: &str,
) -> Result<(), Error> {
    if !host_path.exists() {
        return Err(Error::SourceNotFound(host_path.to_path_buf()));
    }

    let target = dest_path(dest_subdir, &base_name(host_path)?);

    info!(
        "Uploading {} to {}",
        host_path.display(),
        target.display()
    );

    session.mount(MountName::Dest)?;
    session.backend.upload(host_path, &target)
}

fn copy_from_source<B: Backend>(
    session: &mut Session<B>,
    name: &str,
    dest_subdir: &str,
) -> Result<(), Error> {
    session.mount(MountName::Source)?;
    session.mount(MountName::Dest)?;

    let src = PathBuf::from("/source").join(name);
    if !session.backend.exists(&src)? {
        warn!("{name} not found on the source image, skipping it");
        return Ok(());
    }

    let dst = if dest_subdir.is_empty() {
        PathBuf::from("/dest")
    } else {
        PathBuf::from("/dest").join(dest_subdir)
    };

    info!("Copying {name} to {}", dst.display());

    session.backend.copy_recursive(&src, &dst)
}

/// Copies each named path, dispatching on its shape: the two sentinel
/// names, host paths (`/...` or `./...`), else paths on the mounted
/// source. Missing source paths are a warning, not an error.
pub(crate) fn copy_named<B: Backend>(
    session: &mut Session<B>,
    names: &[String],
    dest_subdir: &str,
) -> Result<(), Error> {
    for name in names {
        match name.as_str() {
            ISO_FILE => copy_image_file(session)?,
            ISOLINUX_AS_SYSLINUX => stage_boot_config(session)?,
            _ if name.starts_with('/') || name.starts_with("./") => {
                upload_file(session, Path::new(name), dest_subdir)?;
            }
            _ => copy_from_source(session, name, dest_subdir)?,
        }
    }

    Ok(())
}

/// Expands `pattern` against the source root and copies every match.
/// With `exclude_boot_staging`, a match named after the boot-loader
/// staging directory is skipped.
pub(crate) fn copy_glob<B: Backend>(
    session: &mut Session<B>,
    pattern: &str,
    dest_subdir: &str,
    exclude_boot_staging: bool,
) -> Result<(), Error> {
    session.mount(MountName::Source)?;
    session.mount(MountName::Dest)?;

    let matches = session
        .backend
        .glob_expand(&format!("/source/{pattern}"))?;

    for matched in matches {
        let name = matched
            .strip_prefix("/source/")
            .unwrap_or(&matched)
            .trim_end_matches('/');

        if exclude_boot_staging && name == SOURCE_BOOT_STAGING {
            debug!("Skipping {name}, the boot-loader stage handles it");
            continue;
        }

        copy_from_source(session, name, dest_subdir)?;
    }

    Ok(())
}

/// Copies everything under the source root except the boot-loader
/// staging directory.
pub(crate) fn copy_all<B: Backend>(
    session: &mut Session<B>,
    dest_subdir: &str,
) -> Result<(), Error> {
    copy_glob(session, "*", dest_subdir, true)
}

/// Copies the source image file itself into the destination root.
pub(crate) fn copy_image_file<B: Backend>(session: &mut Session<B>) -> Result<(), Error> {
    let host_path = session.source_path().to_path_buf();
    upload_file(session, &host_path, "")
}

/// Stages the source's installer-boot directory as the destination's
/// boot directory, then overwrites the active boot-menu config with
/// the staged one.
pub(crate) fn stage_boot_config<B: Backend>(session: &mut Session<B>) -> Result<(), Error> {
    session.mount(MountName::Source)?;
    session.mount(MountName::Dest)?;

    let staging = PathBuf::from("/source").join(SOURCE_BOOT_STAGING);
    let boot_dir = PathBuf::from("/dest").join(DEST_BOOT_DIR);

    if session.backend.is_dir(&staging)? {
        info!(
            "Staging {} as {}",
            staging.display(),
            boot_dir.display()
        );

        session.backend.copy_recursive(&staging, &boot_dir)?;
    } else {
        warn!("No {} directory on the source image", staging.display());
    }

    let staged_config = boot_dir.join("isolinux.cfg");
    if session.backend.is_file(&staged_config)? {
        let active_config = boot_dir.join("syslinux.cfg");

        debug!(
            "Promoting {} to {}",
            staged_config.display(),
            active_config.display()
        );

        session
            .backend
            .copy_recursive(&staged_config, &active_config)?;
    }

    Ok(())
}

/// Rewrites the lines of `path` matching `line_pattern`, replacing the
/// literal `find` with `replace` on each. The file is written back
/// only when at least one line matched and the text actually changed.
pub(crate) fn patch_file<B: Backend>(
    session: &mut Session<B>,
    path: &Path,
    line_pattern: &str,
    find: &str,
    replace: &str,
) -> Result<PatchOutcome, Error> {
    session.mount(MountName::Dest)?;

    if !session.backend.is_file(path)? {
        return Err(Error::TargetNotFound(path.to_path_buf()));
    }

    let matcher = Regex::new(line_pattern)?;
    let text = session.backend.read_text(path)?;

    let mut matched = 0_u32;
    let mut replacements = 0_u32;
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        if matcher.is_match(line) {
            matched += 1;

            let replaced = line.replace(find, replace);
            if replaced != line {
                replacements += 1;
            }

            out.push_str(&replaced);
        } else {
            out.push_str(line);
        }

        out.push('\n');
    }

    if !text.ends_with('\n') {
        out.pop();
    }

    if matched == 0 {
        warn!("No lines matched {line_pattern} in {}", path.display());
        return Ok(PatchOutcome::NoMatch);
    }

    if out == text {
        info!(
            "No replacements made in {}, leaving it alone",
            path.display()
        );
        return Ok(PatchOutcome::Unchanged);
    }

    info!(
        "Patched {matched} matching lines ({replacements} changed) in {}",
        path.display()
    );

    session.backend.write_text(path, &out)?;

    Ok(PatchOutcome::Written)
}

/// Displays each path: directory entries for a directory, content for
/// a file.
pub(crate) fn inspect_paths<B: Backend>(
    session: &mut Session<B>,
    paths: &[PathBuf],
) -> Result<(), Error> {
    for path in paths {
        if path.starts_with("/source") {
            session.mount(MountName::Source)?;
        } else {
            session.mount(MountName::Dest)?;
        }

        if session.backend.is_dir(path)? {
            println!("{}:", path.display());
            for name in session.backend.list_dir(path)? {
                println!("  {name}");
            }
        } else if session.backend.is_file(path)? {
            println!("{}:", path.display());
            print!("{}", session.backend.read_text(path)?);
        } else {
            warn!("{} doesn't exist", path.display());
        }
    }

    Ok(())
}
