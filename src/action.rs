//! The pipeline: ordered, data-only actions run against a session.

use core::fmt;
use std::path::PathBuf;

use crate::{
    backend::Backend,
    label, ops,
    session::Session,
    syslinux::{self, SupportFiles},
    types::Error,
};

/// One unit of work. Actions carry their own parameters and borrow
/// the session only while running.
#[derive(Clone, Debug)]
pub(crate) enum Action {
    /// Creates, partitions and formats the destination image.
    CreateDestination { size_mib: u64, force: bool },

    /// Opens an existing destination image.
    BeginUpdate,

    /// Copies named paths, with the sentinel and host-path dispatch of
    /// [`ops::copy_named`].
    CopyNamed {
        names: Vec<String>,
        dest_subdir: String,
    },

    /// Copies every source path matching a shell-style pattern.
    CopyGlob {
        pattern: String,
        dest_subdir: String,
        exclude_boot_staging: bool,
    },

    /// Copies all source content except the boot-loader staging dir.
    CopyAll { dest_subdir: String },

    /// Copies the source image file itself.
    CopyImageFile,

    /// Stages the source's installer-boot directory as the
    /// destination's boot directory.
    StageBootConfig,

    /// Writes the boot record and runs the boot-loader installer.
    InstallBootLoader { support: SupportFiles },

    /// Rewrites matching lines of a destination file.
    PatchFile {
        path: PathBuf,
        line_pattern: String,
        find: String,
        replace: String,
    },

    /// Sets the destination volume label.
    UpdateLabel {
        label: Option<String>,
        patch_config: bool,
    },

    /// Displays files or directory listings.
    InspectPaths { paths: Vec<PathBuf> },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDestination { size_mib, .. } => {
                write!(f, "Creating the destination image ({size_mib} MiB)")
            }
            Self::BeginUpdate => f.write_str("Opening the destination image"),
            Self::CopyNamed { names, .. } => write!(f, "Copying {}", names.join(", ")),
            Self::CopyGlob { pattern, .. } => write!(f, "Copying files matching {pattern}"),
            Self::CopyAll { .. } => f.write_str("Copying all source content"),
            Self::CopyImageFile => f.write_str("Copying the source image file"),
            Self::StageBootConfig => f.write_str("Staging the boot-menu configuration"),
            Self::InstallBootLoader { .. } => f.write_str("Installing the boot loader"),
            Self::PatchFile { path, .. } => write!(f, "Patching {}", path.display()),
            Self::UpdateLabel { .. } => f.write_str("Updating the volume label"),
            Self::InspectPaths { paths } => {
                let names = paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>();
                write!(f, "Inspecting {}", names.join(", "))
            }
        }
    }
}

impl Action {
    /// Runs the action. `Ok(false)` is a failure the action already
    /// reported itself.
    pub(crate) fn run<B: Backend>(&self, session: &mut Session<B>) -> Result<bool, Error> {
        match self {
            Self::CreateDestination { size_mib, force } => {
                session.prepare_for_build(*size_mib, *force)?;
            }
            Self::BeginUpdate => session.prepare_for_update()?,
            Self::CopyNamed { names, dest_subdir } => {
                ops::copy_named(session, names, dest_subdir)?;
            }
            Self::CopyGlob {
                pattern,
                dest_subdir,
                exclude_boot_staging,
            } => ops::copy_glob(session, pattern, dest_subdir, *exclude_boot_staging)?,
            Self::CopyAll { dest_subdir } => ops::copy_all(session, dest_subdir)?,
            Self::CopyImageFile => ops::copy_image_file(session)?,
            Self::StageBootConfig => ops::stage_boot_config(session)?,
            Self::InstallBootLoader { support } => syslinux::install(session, support)?,
            Self::PatchFile {
                path,
                line_pattern,
                find,
                replace,
            } => {
                let outcome = ops::patch_file(session, path, line_pattern, find, replace)?;
                return Ok(outcome != ops::PatchOutcome::NoMatch);
            }
            Self::UpdateLabel {
                label,
                patch_config,
            } => label::update_label(session, label.as_deref(), *patch_config)?,
            Self::InspectPaths { paths } => ops::inspect_paths(session, paths)?,
        }

        Ok(true)
    }
}

/// An ordered action list. Mutable before a run, immutable during.
#[derive(Debug, Default)]
pub(crate) struct Pipeline {
    actions: Vec<Action>,
}

impl Pipeline {
    pub(crate) fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub(crate) fn clear(&mut self) {
        self.actions.clear();
    }

    /// Runs every action in order, stopping at the first failure. The
    /// description of each action goes to stdout unless logging
    /// already covers it.
    pub(crate) fn run<B: Backend>(
        &self,
        session: &mut Session<B>,
        quiet: bool,
        verbose: bool,
    ) -> Result<(), Error> {
        for action in &self.actions {
            if !quiet && !verbose {
                println!("{action}");
            }

            if !action.run(session)? {
                return Err(Error::ActionFailed(action.to_string()));
            }
        }

        Ok(())
    }
}

/// The CentOS 7 install-media pipeline: boot config, install images,
/// boot loader, label, then the distribution payload.
pub(crate) fn centos7(label: Option<String>, support: SupportFiles) -> Vec<Action> {
    let payload = [
        "CentOS_BuildTag",
        "EULA",
        "GPL",
        "RPM-GPG-KEY-CentOS-7",
        "RPM-GPG-KEY-CentOS-Testing-7",
        ".discinfo",
        ".treeinfo",
        "LiveOS",
        "Packages",
        "repodata",
    ];

    vec![
        Action::StageBootConfig,
        Action::CopyNamed {
            names: vec!["images".to_owned()],
            dest_subdir: String::new(),
        },
        Action::InstallBootLoader { support },
        Action::UpdateLabel {
            label,
            patch_config: true,
        },
        Action::CopyNamed {
            names: payload.iter().map(|&name| name.to_owned()).collect(),
            dest_subdir: String::new(),
        },
    ]
}

/// The generic pipeline: boot config, boot loader, label, everything
/// else.
pub(crate) fn defaults(label: Option<String>, support: SupportFiles) -> Vec<Action> {
    vec![
        Action::StageBootConfig,
        Action::InstallBootLoader { support },
        Action::UpdateLabel {
            label,
            patch_config: true,
        },
        Action::CopyAll {
            dest_subdir: String::new(),
        },
    ]
}

pub(crate) fn minimal() -> Vec<Action> {
    Vec::new()
}
