//! Loop-device implementation of the disk backend.
//!
//! Images are attached as loop devices with partition scanning, the
//! backend namespace (`/source`, `/dest`) is rooted in a private temp
//! directory, and filesystems are created and labeled through the
//! usual host tools (`mkfs.*`, `fatlabel`, `e2label`, `blkid`,
//! `syslinux`).

use core::fmt;
use std::{
    collections::BTreeMap,
    env,
    fs::{self, File},
    io::{self, Seek as _, Write as _},
    os::fd::AsFd as _,
    path::{Path, PathBuf},
    process::Command,
};

use globset::Glob;
use log::{debug, error, trace, warn};
use loopdev::LoopControl;
use serde::Deserialize;
use sys_mount::{FilesystemType, Mount, Unmount as _, UnmountFlags};
use temp_dir::TempDir;
use walkdir::WalkDir;

use crate::{
    mbr,
    types::{Error, FsKind},
};

use super::Backend;

const MOUNT_FS_TYPES: &[&str] = &["ext4", "vfat", "iso9660", "udf"];

struct AttachedImage {
    loopdev: loopdev::LoopDevice,
    node: PathBuf,
    file: File,
}

impl fmt::Debug for AttachedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedImage")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl AttachedImage {
    fn create(ctrl: &LoopControl, file: File, readonly: bool) -> Result<Self, io::Error> {
        let loop_device = ctrl.next_free()?;

        let node = loop_device.path().ok_or(io::Error::new(
            io::ErrorKind::NotFound,
            "Loop Device File Not Found",
        ))?;

        debug!("Using loop device {}", node.display());

        loop_device
            .with()
            .part_scan(true)
            .read_only(readonly)
            .attach_fd(file.as_fd())?;

        debug!("Attached the loop device to our file");

        Ok(Self {
            loopdev: loop_device,
            node,
            file,
        })
    }
}

impl Drop for AttachedImage {
    fn drop(&mut self) {
        debug!("Destroying our loop device");

        let res = self.loopdev.detach();
        if let Err(e) = res {
            error!("Couldn't detach the Loop Device: {}", e);
        }

        debug!("Loop device detached");
    }
}

fn is_dir_in_root(root: &Path, path: &Path) -> bool {
    if let Ok(p) = path.canonicalize() {
        return p.starts_with(root);
    }

    if let Some(p) = path.parent() {
        is_dir_in_root(root, p)
    } else {
        false
    }
}

/// Resolves a backend-namespace path against `root`, refusing to
/// escape it through `..` or symlinks.
fn join_path(root: &Path, path: &Path) -> Result<PathBuf, io::Error> {
    let joined = if path.is_absolute() {
        let mut joined = root.to_path_buf();

        for part in path.components() {
            match part {
                std::path::Component::Prefix(_) => unreachable!(),
                std::path::Component::RootDir | std::path::Component::CurDir => {}
                std::path::Component::ParentDir => joined.push(".."),
                std::path::Component::Normal(c) => joined.push(c),
            }
        }

        joined
    } else {
        root.join(path)
    };

    let canonical = match joined.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            if e.kind() == io::ErrorKind::NotFound && is_dir_in_root(root, &joined) {
                return Ok(joined);
            }

            return Err(e);
        }
    };

    if !canonical.starts_with(root) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path isn't contained in root",
        ));
    }

    Ok(canonical)
}

fn run_tool(command: &mut Command) -> Result<Vec<u8>, Error> {
    trace!("Running {:?}", command);

    let output = command.output()?;
    if !output.status.success() {
        return Err(Error::Custom(format!(
            "{:?} failed: {}",
            command.get_program(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output.stdout)
}

fn tool_in_path(name: &str) -> bool {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(name).exists()))
        .unwrap_or(false)
}

pub(crate) struct HostBackend {
    control: LoopControl,
    root: TempDir,
    devices: Vec<AttachedImage>,
    mounts: BTreeMap<PathBuf, Mount>,
    fs_kinds: BTreeMap<String, FsKind>,
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("root", &self.root.path())
            .field("devices", &self.devices)
            .field("fs_kinds", &self.fs_kinds)
            .finish_non_exhaustive()
    }
}

impl HostBackend {
    fn resolve(&self, path: &Path) -> Result<PathBuf, Error> {
        Ok(join_path(self.root.path(), path)?)
    }

    fn device(&self, node: &str) -> Result<&AttachedImage, Error> {
        self.devices
            .iter()
            .find(|d| d.node == Path::new(node))
            .ok_or(Error::ResourceUnavailable("attached device"))
    }

    fn fs_kind_of(&mut self, partition: &str) -> Result<FsKind, Error> {
        if let Some(fs) = self.fs_kinds.get(partition) {
            return Ok(fs.clone());
        }

        let stdout = run_tool(Command::new("blkid").args(["-o", "value", "-s", "TYPE", partition]))?;
        let name = String::from_utf8_lossy(&stdout).trim().to_owned();

        debug!("blkid reports {partition} as {name}");

        name.parse()
    }
}

impl Backend for HostBackend {
    fn connect() -> Result<Self, Error> {
        let control = LoopControl::open()
            .map_err(|e| Error::BackendUnavailable(format!("loop control: {e}")))?;

        let root = TempDir::new().map_err(|e| Error::BackendUnavailable(format!("temp dir: {e}")))?;
        debug!("Backend namespace root is {}", root.path().display());

        Ok(Self {
            control,
            root,
            devices: Vec::new(),
            mounts: BTreeMap::new(),
            fs_kinds: BTreeMap::new(),
        })
    }

    fn create_image(&mut self, path: &Path, size: u64) -> Result<(), Error> {
        debug!("Creating raw image {} of {size} bytes", path.display());

        let file = File::create(path)?;
        file.set_len(size)?;

        Ok(())
    }

    fn attach_image(&mut self, path: &Path, readonly: bool) -> Result<String, Error> {
        let file = File::options()
            .read(true)
            .write(!readonly)
            .open(path)?;

        let attached = AttachedImage::create(&self.control, file, readonly)?;
        let node = attached.node.to_string_lossy().into_owned();

        self.devices.push(attached);

        Ok(node)
    }

    fn list_devices(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| d.node.to_string_lossy().into_owned())
            .collect()
    }

    fn list_partitions(&mut self) -> Result<Vec<String>, Error> {
        #[derive(Debug, Deserialize)]
        struct LsblkPartition {
            path: PathBuf,
        }

        #[derive(Debug, Deserialize)]
        struct LsblkDevice {
            #[serde(rename = "children", default)]
            parts: Vec<LsblkPartition>,
        }

        #[derive(Debug, Deserialize)]
        struct LsblkOutput {
            #[serde(rename = "blockdevices")]
            devices: Vec<LsblkDevice>,
        }

        let mut partitions = Vec::new();

        for device in &self.devices {
            let stdout = run_tool(
                Command::new("lsblk")
                    .args(["--bytes", "--json", "--paths", "--output-all"])
                    .arg(device.node.as_os_str()),
            )?;

            let res: LsblkOutput = serde_json::from_slice(&stdout)?;

            for dev in &res.devices {
                partitions.extend(
                    dev.parts
                        .iter()
                        .map(|p| p.path.to_string_lossy().into_owned()),
                );
            }
        }

        Ok(partitions)
    }

    fn partition_device(&mut self, device: &str, start_lba: u64, fs: &FsKind) -> Result<(), Error> {
        let attached = self.device(device)?;
        let total_sectors = attached.file.metadata()?.len() / mbr::SECTOR_SIZE;

        let part_type = if fs.is_fat() {
            mbr::PART_TYPE_FAT32_LBA
        } else {
            mbr::PART_TYPE_LINUX
        };

        let sector = mbr::boot_sector(total_sectors, start_lba, part_type, false)?;

        self.write_device_at(device, &sector, 0)?;

        // Let the kernel pick up the new partition table.
        run_tool(Command::new("partprobe").arg(device))?;

        Ok(())
    }

    fn set_bootable(&mut self, device: &str, part_num: u32, bootable: bool) -> Result<(), Error> {
        let flag = if bootable { [0x80_u8] } else { [0x00_u8] };
        self.write_device_at(device, &flag, mbr::part_entry_offset(part_num))
    }

    fn make_filesystem(&mut self, partition: &str, fs: &FsKind) -> Result<(), Error> {
        debug!("Creating {fs} filesystem on {partition}");

        run_tool(Command::new(format!("mkfs.{}", fs.as_str())).arg(partition))?;

        self.fs_kinds.insert(partition.to_owned(), fs.clone());

        Ok(())
    }

    fn set_filesystem_label(&mut self, partition: &str, label: &str) -> Result<(), Error> {
        let fs = self.fs_kind_of(partition)?;

        match fs {
            FsKind::Vfat => run_tool(Command::new("fatlabel").args([partition, label]))?,
            FsKind::Ext4 => run_tool(Command::new("e2label").args([partition, label]))?,
            FsKind::Other(name) => {
                return Err(Error::Custom(format!(
                    "Don't know how to label a {name} filesystem"
                )))
            }
        };

        Ok(())
    }

    fn filesystem_label(&mut self, partition: &str) -> Result<String, Error> {
        let output = Command::new("blkid")
            .args(["-o", "value", "-s", "LABEL", partition])
            .output()?;

        // blkid exits non-zero for an unlabeled filesystem.
        if !output.status.success() {
            return Ok(String::new());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn make_mount_point(&mut self, path: &Path) -> Result<(), Error> {
        fs::create_dir_all(self.resolve(path)?)?;
        Ok(())
    }

    fn mount(&mut self, device: &str, path: &Path) -> Result<(), Error> {
        let target = self.resolve(path)?;

        debug!("Mounting {device} on {}", target.display());

        let mount = Mount::builder()
            .fstype(FilesystemType::Set(MOUNT_FS_TYPES))
            .mount(device, &target)?;

        trace!("Mount Successful");

        self.mounts.insert(path.to_path_buf(), mount);

        Ok(())
    }

    fn unmount(&mut self, path: &Path) -> Result<(), Error> {
        let mount = self
            .mounts
            .remove(path)
            .ok_or(Error::ResourceUnavailable("mount"))?;

        debug!("Unmounting {}", path.display());

        mount.unmount(UnmountFlags::DETACH)?;

        Ok(())
    }

    fn exists(&mut self, path: &Path) -> Result<bool, Error> {
        Ok(self.resolve(path)?.exists())
    }

    fn is_dir(&mut self, path: &Path) -> Result<bool, Error> {
        Ok(self.resolve(path)?.is_dir())
    }

    fn is_file(&mut self, path: &Path) -> Result<bool, Error> {
        Ok(self.resolve(path)?.is_file())
    }

    fn list_dir(&mut self, path: &Path) -> Result<Vec<String>, Error> {
        let mut names = fs::read_dir(self.resolve(path)?)?
            .map(|res| res.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>, io::Error>>()?;
        names.sort();

        Ok(names)
    }

    fn read_text(&mut self, path: &Path) -> Result<String, Error> {
        Ok(fs::read_to_string(self.resolve(path)?)?)
    }

    fn write_text(&mut self, path: &Path, content: &str) -> Result<(), Error> {
        fs::write(self.resolve(path)?, content)?;
        Ok(())
    }

    fn copy_recursive(&mut self, src: &Path, dst: &Path) -> Result<(), Error> {
        let source = self.resolve(src)?;
        if !source.exists() {
            return Err(Error::SourceNotFound(src.to_path_buf()));
        }

        let dst = self.resolve(dst)?;
        let target = if dst.is_dir() {
            match source.file_name() {
                Some(name) => dst.join(name),
                None => dst,
            }
        } else {
            dst
        };

        debug!("Copying {} to {}", source.display(), target.display());

        if source.is_file() {
            fs::copy(&source, &target)?;
            return Ok(());
        }

        for entry in WalkDir::new(&source) {
            let entry = entry.map_err(|e| Error::Custom(format!("walk failed: {e}")))?;
            let rel = entry
                .path()
                .strip_prefix(&source)
                .map_err(|e| Error::Custom(format!("walk escaped its root: {e}")))?;
            let dest = target.join(rel);

            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&dest)?;
                fs::set_permissions(&dest, entry.metadata().map(|m| m.permissions()).map_err(
                    |e| Error::Custom(format!("metadata failed: {e}")),
                )?)?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &dest)?;
            } else {
                fs::copy(entry.path(), &dest)?;
            }
        }

        Ok(())
    }

    fn upload(&mut self, host_src: &Path, dst: &Path) -> Result<(), Error> {
        let target = self.resolve(dst)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        debug!("Uploading {} to {}", host_src.display(), target.display());

        fs::copy(host_src, target)?;

        Ok(())
    }

    fn glob_expand(&mut self, pattern: &str) -> Result<Vec<String>, Error> {
        let (parent, leaf) = pattern
            .rsplit_once('/')
            .ok_or_else(|| Error::Custom(format!("Unrooted glob pattern: {pattern}")))?;
        let parent = if parent.is_empty() { "/" } else { parent };

        let matcher = Glob::new(leaf)
            .map_err(|e| Error::Custom(format!("Invalid glob pattern: {e}")))?
            .compile_matcher();

        let dir = self.resolve(Path::new(parent))?;
        let mut matches = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if !matcher.is_match(&name) {
                continue;
            }

            let sep = if parent == "/" { "" } else { "/" };
            if entry.file_type()?.is_dir() {
                matches.push(format!("{parent}{sep}{name}/"));
            } else {
                matches.push(format!("{parent}{sep}{name}"));
            }
        }

        matches.sort();

        Ok(matches)
    }

    fn feature_available(&self, feature: &str) -> bool {
        tool_in_path(feature)
    }

    fn write_device_at(&mut self, device: &str, data: &[u8], offset: u64) -> Result<(), Error> {
        debug!(
            "Writing {} bytes to {device} at offset {offset}",
            data.len()
        );

        let mut file = File::options().write(true).open(device)?;
        file.seek(io::SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()?;

        Ok(())
    }

    fn install_bootloader(&mut self, partition: &str, dir: &Path) -> Result<(), Error> {
        let boot_dir = dir.to_string_lossy();
        let boot_dir = boot_dir.trim_start_matches('/');

        debug!("Running syslinux on {partition}, directory {boot_dir}");

        run_tool(
            Command::new("syslinux")
                .args(["--install", "--directory", boot_dir])
                .arg(partition),
        )?;

        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        while let Some((path, mount)) = self.mounts.pop_last() {
            debug!("Unmounting leftover {}", path.display());

            let res = mount.unmount(UnmountFlags::DETACH);
            if let Err(e) = res {
                error!("Couldn't unmount {}: {e}", path.display());
            }
        }

        if !self.devices.is_empty() {
            warn!("Detaching {} leftover devices", self.devices.len());
        }

        self.devices.clear();

        Ok(())
    }
}
