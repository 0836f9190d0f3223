//! Session lifecycle: owns the backend handle, the attached images,
//! the destination partition and the two well-known mounts.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, error, info, warn};

use crate::{
    backend::Backend,
    types::{Error, FsKind},
};

/// Default destination image size when creating one from scratch.
pub(crate) const DEFAULT_SIZE_MIB: u64 = 12 * 1024;

/// First usable LBA for the destination partition. 1 MiB of alignment
/// also leaves room for the boot loader's stage between the MBR and
/// the filesystem.
pub(crate) const PART_START_LBA: u64 = 2048;

const MIB: u64 = 1024 * 1024;

/// The two mounts a session manages, at fixed namespace paths.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum MountName {
    /// The destination partition's filesystem, mounted read-write.
    Dest,

    /// The source ISO's filesystem, mounted read-only.
    Source,
}

impl MountName {
    pub(crate) fn path(self) -> &'static Path {
        match self {
            Self::Dest => Path::new("/dest"),
            Self::Source => Path::new("/source"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Session<B: Backend> {
    pub(crate) backend: B,

    source_path: PathBuf,
    dest_path: PathBuf,
    fs: FsKind,

    dest_device: Option<String>,
    dest_partition: Option<String>,
    source_device: Option<String>,

    mounted: BTreeSet<MountName>,
    torn_down: bool,
}

impl<B: Backend> Session<B> {
    pub(crate) fn start(
        source_path: PathBuf,
        dest_path: PathBuf,
        fs: FsKind,
    ) -> Result<Self, Error> {
        let backend = B::connect()?;

        Ok(Self {
            backend,
            source_path,
            dest_path,
            fs,
            dest_device: None,
            dest_partition: None,
            source_device: None,
            mounted: BTreeSet::new(),
            torn_down: false,
        })
    }

    pub(crate) fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub(crate) fn fs(&self) -> &FsKind {
        &self.fs
    }

    pub(crate) fn dest_device(&self) -> Result<&str, Error> {
        self.dest_device
            .as_deref()
            .ok_or(Error::ResourceUnavailable("destination device"))
    }

    pub(crate) fn dest_partition(&self) -> Result<&str, Error> {
        self.dest_partition
            .as_deref()
            .ok_or(Error::ResourceUnavailable("destination partition"))
    }

    /// Attaches the source and destination images, creating the
    /// destination first when `create` is set.
    ///
    /// The destination is always the first attached device so its
    /// partitions sort ahead of the source's during discovery. A build
    /// needs the source image; an update runs without one (the copy
    /// actions just have nothing to read from).
    fn attach_images(&mut self, create: bool, size_mib: u64, force: bool) -> Result<(), Error> {
        if create && !self.source_path.exists() {
            return Err(Error::ImageMissing(self.source_path.clone()));
        }

        if create {
            if self.dest_path.exists() {
                if !force {
                    return Err(Error::PreconditionViolated(format!(
                        "{} already exists, not overwriting it",
                        self.dest_path.display()
                    )));
                }

                info!("Removing stale {}", self.dest_path.display());
                fs::remove_file(&self.dest_path)?;
            }

            info!(
                "Creating {} ({size_mib} MiB)",
                self.dest_path.display()
            );

            self.backend.create_image(&self.dest_path, size_mib * MIB)?;
        } else if !self.dest_path.exists() {
            return Err(Error::ImageMissing(self.dest_path.clone()));
        }

        let dest_path = self.dest_path.clone();
        let dest_device = self.backend.attach_image(&dest_path, false)?;
        debug!("Destination image attached as {dest_device}");
        self.dest_device = Some(dest_device);

        if self.source_path.exists() {
            let source_path = self.source_path.clone();
            let source_device = self.backend.attach_image(&source_path, true)?;
            debug!("Source image attached as {source_device}");
            self.source_device = Some(source_device);
        } else {
            warn!(
                "No source image at {}, continuing without it",
                self.source_path.display()
            );
        }

        debug!("Attached devices: {:?}", self.backend.list_devices());

        Ok(())
    }

    /// Locates the destination partition, partitioning and formatting
    /// the device first when `create` is set.
    fn discover_or_create_partition(&mut self, create: bool) -> Result<(), Error> {
        let device = self.dest_device()?.to_owned();

        if create {
            info!("Partitioning {device}");

            self.backend
                .partition_device(&device, PART_START_LBA, &self.fs)?;
            self.backend.set_bootable(&device, 1, true)?;
        }

        let partition = self
            .backend
            .list_partitions()?
            .into_iter()
            .find(|p| p.starts_with(&device))
            .ok_or(Error::NoPartitionFound)?;

        debug!("Destination partition is {partition}");

        if create {
            info!("Creating a {} filesystem on {partition}", self.fs);
            self.backend.make_filesystem(&partition, &self.fs)?;
        }

        self.dest_partition = Some(partition);

        Ok(())
    }

    /// Mounts one of the session filesystems. Already-mounted names
    /// are left alone.
    pub(crate) fn mount(&mut self, name: MountName) -> Result<(), Error> {
        if self.mounted.contains(&name) {
            return Ok(());
        }

        let device = match name {
            MountName::Dest => self.dest_partition()?,
            MountName::Source => self
                .source_device
                .as_deref()
                .ok_or(Error::ResourceUnavailable("source device"))?,
        }
        .to_owned();

        self.backend.make_mount_point(name.path())?;
        self.backend.mount(&device, name.path())?;
        self.mounted.insert(name);

        Ok(())
    }

    pub(crate) fn unmount(&mut self, name: MountName) -> Result<(), Error> {
        if !self.mounted.contains(&name) {
            return Ok(());
        }

        self.backend.unmount(name.path())?;
        self.mounted.remove(&name);

        Ok(())
    }

    fn mount_all(&mut self) -> Result<(), Error> {
        self.mount(MountName::Dest)?;

        if self.source_device.is_some() {
            self.mount(MountName::Source)?;
        }

        Ok(())
    }

    pub(crate) fn prepare_for_build(
        &mut self,
        size_mib: u64,
        force: bool,
    ) -> Result<(), Error> {
        self.attach_images(true, size_mib, force)?;
        self.discover_or_create_partition(true)?;
        self.mount_all()
    }

    pub(crate) fn prepare_for_update(&mut self) -> Result<(), Error> {
        self.attach_images(false, 0, false)?;
        self.discover_or_create_partition(false)?;
        self.mount_all()
    }

    /// Inspect setup tolerates a missing image on either side: only
    /// what is actually present gets attached and mounted.
    pub(crate) fn prepare_for_inspect(&mut self) -> Result<(), Error> {
        if self.dest_path.exists() {
            let dest_path = self.dest_path.clone();
            let device = self.backend.attach_image(&dest_path, false)?;
            debug!("Destination image attached as {device}");
            self.dest_device = Some(device);
        } else {
            warn!("No destination image at {}", self.dest_path.display());
        }

        if self.source_path.exists() {
            let source_path = self.source_path.clone();
            let device = self.backend.attach_image(&source_path, true)?;
            debug!("Source image attached as {device}");
            self.source_device = Some(device);
        } else {
            warn!("No source image at {}", self.source_path.display());
        }

        if self.dest_device.is_some() {
            self.discover_or_create_partition(false)?;
            self.mount(MountName::Dest)?;
        }

        if self.source_device.is_some() {
            self.mount(MountName::Source)?;
        }

        Ok(())
    }

    /// Releases mounts and devices. Safe to call more than once; only
    /// the first call does any work.
    pub(crate) fn teardown(&mut self) -> Result<(), Error> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        debug!("Tearing the session down");

        while let Some(name) = self.mounted.pop_last() {
            let res = self.backend.unmount(name.path());
            if let Err(e) = res {
                warn!("Couldn't unmount {}: {e}", name.path().display());
            }
        }

        self.dest_partition = None;
        self.dest_device = None;
        self.source_device = None;

        self.backend.shutdown()
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }

        let res = self.teardown();
        if let Err(e) = res {
            error!("Session teardown failed: {e}");
        }
    }
}
