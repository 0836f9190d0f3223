#![doc = include_str!("../README.md")]

use std::{
    path::{Path, PathBuf},
    process,
};

use anyhow::Result;
use clap::{ArgAction, CommandFactory as _, Parser};
use log::{error, info, LevelFilter};

use crate::{
    action::{Action, Pipeline},
    backend::{host::HostBackend, Backend},
    session::{Session, DEFAULT_SIZE_MIB},
    syslinux::SupportFiles,
    types::{Error, FsKind},
};

mod action;
mod backend;
mod label;
mod mbr;
mod ops;
mod session;
mod syslinux;
#[cfg(test)]
mod testutil;
mod types;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Destination image file
    #[arg(short, long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Source ISO image file
    #[arg(short, long, value_name = "PATH")]
    iso: Option<PathBuf>,

    /// Destination image size, in MiB, when creating it
    #[arg(short, long, default_value_t = DEFAULT_SIZE_MIB)]
    size: u64,

    /// Volume label, or "auto" to detect it from the boot-menu config
    #[arg(short, long)]
    label: Option<String>,

    /// Destination partition filesystem
    #[arg(short, long, default_value = "vfat")]
    fstype: FsKind,

    /// Overwrite an existing destination image
    #[arg(long)]
    force: bool,

    /// Create the destination image from scratch
    #[arg(short, long)]
    create: bool,

    /// Update an existing destination image
    #[arg(short, long)]
    update: bool,

    /// Empty the preset pipeline before adding --copy actions
    #[arg(long)]
    clear: bool,

    /// Report failures with their full error chain
    #[arg(long)]
    debug: bool,

    /// Only log errors
    #[arg(long)]
    quiet: bool,

    /// Raise the log verbosity, repeatable
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Display a path on the image, or patch it with --sed
    #[arg(long, alias = "edit", value_name = "PATH")]
    inspect: Option<PathBuf>,

    /// Rewrite lines matching PATTERN, replacing FIND with REPLACE
    #[arg(
        long,
        num_args = 3,
        value_names = ["PATTERN", "FIND", "REPLACE"],
        requires = "inspect"
    )]
    sed: Option<Vec<String>>,

    /// Add a copy action per name to the pipeline
    #[arg(long, num_args = 0.., value_name = "NAME")]
    copy: Option<Vec<String>>,

    /// Use the CentOS 7 install-media pipeline
    #[arg(long, group = "preset")]
    centos7: bool,

    /// Use the generic pipeline (the default)
    #[arg(long, group = "preset")]
    defaults: bool,

    /// Start from an empty pipeline
    #[arg(long, group = "preset")]
    minimal: bool,
}

impl Cli {
    fn pipeline(&self) -> Pipeline {
        let support = SupportFiles::default();

        let preset = if self.centos7 {
            action::centos7(self.label.clone(), support)
        } else if self.minimal {
            action::minimal()
        } else {
            action::defaults(self.label.clone(), support)
        };

        let mut pipeline = Pipeline::default();
        for action in preset {
            pipeline.push(action);
        }

        if self.clear {
            pipeline.clear();
        }

        for name in self.copy.iter().flatten() {
            pipeline.push(copy_action(name));
        }

        pipeline
    }

    /// The single ad-hoc action inspect mode runs instead of the
    /// pipeline.
    fn inspect_action(&self) -> Option<Action> {
        let path = self.inspect.clone()?;

        Some(match self.sed.as_deref() {
            Some([pattern, find, replace]) => Action::PatchFile {
                path,
                line_pattern: pattern.clone(),
                find: find.clone(),
                replace: replace.clone(),
            },
            Some(_) | None => Action::InspectPaths { paths: vec![path] },
        })
    }
}

/// Maps a `--copy` name to its action: the staging sentinels, a glob,
/// or a plain named copy.
fn copy_action(name: &str) -> Action {
    match name {
        ops::ISO_FILE => Action::CopyImageFile,
        ops::ISOLINUX_AS_SYSLINUX => Action::StageBootConfig,
        _ if name.contains(['*', '?', '[']) => Action::CopyGlob {
            pattern: name.to_owned(),
            dest_subdir: String::new(),
            exclude_boot_staging: false,
        },
        _ => Action::CopyNamed {
            names: vec![name.to_owned()],
            dest_subdir: String::new(),
        },
    }
}

fn run_phase<B: Backend>(cli: &Cli, session: &mut Session<B>) -> Result<(), Error> {
    let setup = if cli.create {
        Action::CreateDestination {
            size_mib: cli.size,
            force: cli.force,
        }
    } else if cli.update {
        Action::BeginUpdate
    } else if let Some(action) = cli.inspect_action() {
        // Inspect-only run: tolerant setup, then just the ad-hoc
        // action, never the configured pipeline.
        session.prepare_for_inspect()?;

        if !action.run(session)? {
            return Err(Error::ActionFailed(action.to_string()));
        }

        return Ok(());
    } else {
        return Err(Error::PreconditionViolated(
            "Pick a mode: --create, --update or --inspect".to_owned(),
        ));
    };

    if !setup.run(session)? {
        return Err(Error::ActionFailed(setup.to_string()));
    }

    let mut pipeline = cli.pipeline();

    // With a build or update underway, --inspect/--sed tacks its
    // action onto the end of the pipeline.
    if let Some(action) = cli.inspect_action() {
        pipeline.push(action);
    }

    pipeline.run(session, cli.quiet, cli.verbose > 0)
}

fn run<B: Backend>(cli: &Cli, source: &Path, dest: &Path) -> Result<(), Error> {
    let mut session: Session<B> = Session::start(
        source.to_path_buf(),
        dest.to_path_buf(),
        cli.fstype.clone(),
    )?;

    let res = run_phase(cli, &mut session);
    let teardown = session.teardown();

    res?;
    teardown
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    env_logger::Builder::new().filter_level(level).init();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let (Some(source), Some(dest)) = (cli.iso.clone(), cli.out.clone()) else {
        Cli::command().print_help()?;
        process::exit(1);
    };

    let res = run::<HostBackend>(&cli, &source, &dest);
    if let Err(e) = res {
        if cli.debug {
            return Err(e.into());
        }

        error!("{e}");
        process::exit(1);
    }

    Ok(())
}
