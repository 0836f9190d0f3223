//! Interface boundary to the disk-emulation backend.
//!
//! The [`Backend`] trait covers the device-level primitives the session
//! consumes: raw image allocation, loop attach, partitioning, mkfs,
//! mounts, file access inside the mounted namespace, raw byte-range
//! writes, and the boot-loader install hook. Paths handed to file
//! operations are backend-namespace absolute paths (`/source/...`,
//! `/dest/...`), not host paths.

use std::path::Path;

use crate::types::{Error, FsKind};

pub(crate) mod host;

pub(crate) trait Backend: Sized {
    /// Acquires the backend handle.
    fn connect() -> Result<Self, Error>;

    /// Allocates a new raw image file of `size` bytes.
    fn create_image(&mut self, path: &Path, size: u64) -> Result<(), Error>;

    /// Attaches an image file as a device and returns its identifier.
    fn attach_image(&mut self, path: &Path, readonly: bool) -> Result<String, Error>;

    fn list_devices(&self) -> Vec<String>;

    fn list_partitions(&mut self) -> Result<Vec<String>, Error>;

    /// Initializes an MBR partition table on `device` with one primary
    /// partition running from `start_lba` to the end of the device.
    fn partition_device(&mut self, device: &str, start_lba: u64, fs: &FsKind)
        -> Result<(), Error>;

    /// Sets the boot flag of partition `part_num` (1-based) on `device`.
    fn set_bootable(&mut self, device: &str, part_num: u32, bootable: bool) -> Result<(), Error>;

    fn make_filesystem(&mut self, partition: &str, fs: &FsKind) -> Result<(), Error>;

    fn set_filesystem_label(&mut self, partition: &str, label: &str) -> Result<(), Error>;

    fn filesystem_label(&mut self, partition: &str) -> Result<String, Error>;

    fn make_mount_point(&mut self, path: &Path) -> Result<(), Error>;

    fn mount(&mut self, device: &str, path: &Path) -> Result<(), Error>;

    fn unmount(&mut self, path: &Path) -> Result<(), Error>;

    fn exists(&mut self, path: &Path) -> Result<bool, Error>;

    fn is_dir(&mut self, path: &Path) -> Result<bool, Error>;

    fn is_file(&mut self, path: &Path) -> Result<bool, Error>;

    /// Lists the entry names directly under `path`.
    fn list_dir(&mut self, path: &Path) -> Result<Vec<String>, Error>;

    fn read_text(&mut self, path: &Path) -> Result<String, Error>;

    fn write_text(&mut self, path: &Path, content: &str) -> Result<(), Error>;

    /// `cp -a` semantics: if `dst` is an existing directory, copy into
    /// it under the source's base name; otherwise copy as `dst`,
    /// overwriting an existing file.
    fn copy_recursive(&mut self, src: &Path, dst: &Path) -> Result<(), Error>;

    /// Copies a host-resident file to the exact namespace path `dst`.
    fn upload(&mut self, host_src: &Path, dst: &Path) -> Result<(), Error>;

    /// Shell-style expansion of the final pattern component. Directory
    /// matches carry a trailing `/`.
    fn glob_expand(&mut self, pattern: &str) -> Result<Vec<String>, Error>;

    fn feature_available(&self, feature: &str) -> bool;

    /// Writes raw bytes at a byte offset of an attached device.
    fn write_device_at(&mut self, device: &str, data: &[u8], offset: u64) -> Result<(), Error>;

    /// Runs the boot-loader installer against an (unmounted) partition
    /// and a boot directory inside its filesystem.
    fn install_bootloader(&mut self, partition: &str, dir: &Path) -> Result<(), Error>;

    /// Releases every device and mount this handle still holds.
    fn shutdown(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
pub(crate) mod mem {
    //! In-memory backend recording every mutation, for lifecycle and
    //! pipeline tests.

    use core::cell::RefCell;
    use std::{
        collections::{BTreeMap, BTreeSet},
        fs,
        path::{Path, PathBuf},
        rc::Rc,
    };

    use globset::Glob;

    use crate::types::{Error, FsKind};

    use super::Backend;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub(crate) enum MemNode {
        File(Vec<u8>),
        Dir,
    }

    #[derive(Clone, Debug)]
    pub(crate) struct MemDevice {
        pub(crate) image: PathBuf,
        pub(crate) name: String,
        pub(crate) readonly: bool,
    }

    #[derive(Clone, Debug)]
    pub(crate) struct BootloaderInstall {
        pub(crate) partition: String,
        pub(crate) dir: PathBuf,
        pub(crate) dest_was_mounted: bool,
    }

    #[derive(Debug, Default)]
    pub(crate) struct MemState {
        pub(crate) connect_error: Option<String>,
        pub(crate) no_syslinux_feature: bool,

        pub(crate) images: BTreeMap<PathBuf, u64>,
        pub(crate) devices: Vec<MemDevice>,
        pub(crate) partitions: Vec<String>,
        pub(crate) part_starts: BTreeMap<String, u64>,
        pub(crate) fs_kinds: BTreeMap<String, FsKind>,
        pub(crate) labels: BTreeMap<String, String>,
        pub(crate) bootable: BTreeMap<(String, u32), bool>,

        pub(crate) nodes: BTreeMap<String, MemNode>,
        pub(crate) mount_points: BTreeSet<String>,
        pub(crate) mounts: BTreeMap<String, String>,

        pub(crate) raw_writes: Vec<(String, u64, Vec<u8>)>,
        pub(crate) bootloader_installs: Vec<BootloaderInstall>,
        pub(crate) text_writes: u32,
        pub(crate) shutdowns: u32,
    }

    fn norm(path: &Path) -> String {
        let s = path.to_string_lossy();
        let trimmed = s.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_owned()
        } else {
            trimmed.to_owned()
        }
    }

    fn parent_of(key: &str) -> Option<String> {
        let idx = key.rfind('/')?;
        if idx == 0 {
            (key.len() > 1).then(|| "/".to_owned())
        } else {
            Some(key[..idx].to_owned())
        }
    }

    fn base_name(key: &str) -> &str {
        key.rsplit('/').next().unwrap_or(key)
    }

    impl MemState {
        fn ensure_parents(&mut self, key: &str) {
            let mut current = parent_of(key);
            while let Some(dir) = current {
                if dir == "/" {
                    break;
                }
                self.nodes.entry(dir.clone()).or_insert(MemNode::Dir);
                current = parent_of(&dir);
            }
        }

        pub(crate) fn seed_dir(&mut self, path: &str) {
            self.ensure_parents(path);
            self.nodes.insert(path.trim_end_matches('/').to_owned(), MemNode::Dir);
        }

        pub(crate) fn seed_file(&mut self, path: &str, content: &str) {
            self.ensure_parents(path);
            self.nodes
                .insert(path.to_owned(), MemNode::File(content.as_bytes().to_vec()));
        }

        pub(crate) fn file_text(&self, path: &str) -> Option<String> {
            match self.nodes.get(path)? {
                MemNode::File(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                MemNode::Dir => None,
            }
        }
    }

    thread_local! {
        static NEXT_STATE: RefCell<Option<Rc<RefCell<MemState>>>> = const { RefCell::new(None) };
    }

    /// Installs the state the next [`MemBackend::connect`] call on this
    /// thread will pick up.
    pub(crate) fn install_state(state: &Rc<RefCell<MemState>>) {
        NEXT_STATE.with(|slot| *slot.borrow_mut() = Some(Rc::clone(state)));
    }

    #[derive(Debug)]
    pub(crate) struct MemBackend {
        state: Rc<RefCell<MemState>>,
    }

    impl Backend for MemBackend {
        fn connect() -> Result<Self, Error> {
            let state = NEXT_STATE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_default();

            if let Some(msg) = state.borrow().connect_error.clone() {
                return Err(Error::BackendUnavailable(msg));
            }

            Ok(Self { state })
        }

        fn create_image(&mut self, path: &Path, size: u64) -> Result<(), Error> {
            self.state.borrow_mut().images.insert(path.to_path_buf(), size);
            Ok(())
        }

        fn attach_image(&mut self, path: &Path, readonly: bool) -> Result<String, Error> {
            let mut state = self.state.borrow_mut();
            let letter = char::from(b'a' + u8::try_from(state.devices.len()).map_err(|_e| {
                Error::Custom("Too many attached devices".to_owned())
            })?);
            let name = format!("/dev/sd{letter}");

            state.devices.push(MemDevice {
                image: path.to_path_buf(),
                name: name.clone(),
                readonly,
            });

            Ok(name)
        }

        fn list_devices(&self) -> Vec<String> {
            self.state.borrow().devices.iter().map(|d| d.name.clone()).collect()
        }

        fn list_partitions(&mut self) -> Result<Vec<String>, Error> {
            Ok(self.state.borrow().partitions.clone())
        }

        fn partition_device(
            &mut self,
            device: &str,
            start_lba: u64,
            _fs: &FsKind,
        ) -> Result<(), Error> {
            let mut state = self.state.borrow_mut();
            let part = format!("{device}1");
            state.part_starts.insert(part.clone(), start_lba);
            state.partitions.push(part);
            Ok(())
        }

        fn set_bootable(&mut self, device: &str, part_num: u32, bootable: bool) -> Result<(), Error> {
            self.state
                .borrow_mut()
                .bootable
                .insert((device.to_owned(), part_num), bootable);
            Ok(())
        }

        fn make_filesystem(&mut self, partition: &str, fs: &FsKind) -> Result<(), Error> {
            self.state
                .borrow_mut()
                .fs_kinds
                .insert(partition.to_owned(), fs.clone());
            Ok(())
        }

        fn set_filesystem_label(&mut self, partition: &str, label: &str) -> Result<(), Error> {
            self.state
                .borrow_mut()
                .labels
                .insert(partition.to_owned(), label.to_owned());
            Ok(())
        }

        fn filesystem_label(&mut self, partition: &str) -> Result<String, Error> {
            Ok(self
                .state
                .borrow()
                .labels
                .get(partition)
                .cloned()
                .unwrap_or_default())
        }

        fn make_mount_point(&mut self, path: &Path) -> Result<(), Error> {
            self.state.borrow_mut().mount_points.insert(norm(path));
            Ok(())
        }

        fn mount(&mut self, device: &str, path: &Path) -> Result<(), Error> {
            let mut state = self.state.borrow_mut();
            let key = norm(path);
            if !state.mount_points.contains(&key) {
                return Err(Error::Custom(format!("No mount point at {key}")));
            }
            state.mounts.insert(key, device.to_owned());
            Ok(())
        }

        fn unmount(&mut self, path: &Path) -> Result<(), Error> {
            self.state
                .borrow_mut()
                .mounts
                .remove(&norm(path))
                .map(|_dev| ())
                .ok_or_else(|| Error::Custom(format!("{} is not mounted", path.display())))
        }

        fn exists(&mut self, path: &Path) -> Result<bool, Error> {
            Ok(self.state.borrow().nodes.contains_key(&norm(path)))
        }

        fn is_dir(&mut self, path: &Path) -> Result<bool, Error> {
            Ok(matches!(
                self.state.borrow().nodes.get(&norm(path)),
                Some(MemNode::Dir)
            ))
        }

        fn is_file(&mut self, path: &Path) -> Result<bool, Error> {
            Ok(matches!(
                self.state.borrow().nodes.get(&norm(path)),
                Some(MemNode::File(_))
            ))
        }

        fn list_dir(&mut self, path: &Path) -> Result<Vec<String>, Error> {
            let state = self.state.borrow();
            let key = norm(path);

            if !matches!(state.nodes.get(&key), Some(MemNode::Dir)) {
                return Err(Error::Custom(format!("{key} is not a directory")));
            }

            let prefix = if key == "/" { "/".to_owned() } else { format!("{key}/") };
            Ok(state
                .nodes
                .keys()
                .filter(|k| k.starts_with(&prefix) && !k[prefix.len()..].contains('/'))
                .map(|k| base_name(k).to_owned())
                .collect())
        }

        fn read_text(&mut self, path: &Path) -> Result<String, Error> {
            let state = self.state.borrow();
            match state.nodes.get(&norm(path)) {
                Some(MemNode::File(bytes)) => Ok(String::from_utf8_lossy(bytes).into_owned()),
                Some(MemNode::Dir) | None => Err(Error::TargetNotFound(path.to_path_buf())),
            }
        }

        fn write_text(&mut self, path: &Path, content: &str) -> Result<(), Error> {
            let mut state = self.state.borrow_mut();
            let key = norm(path);
            state.ensure_parents(&key);
            state.nodes.insert(key, MemNode::File(content.as_bytes().to_vec()));
            state.text_writes += 1;
            Ok(())
        }

        fn copy_recursive(&mut self, src: &Path, dst: &Path) -> Result<(), Error> {
            let mut state = self.state.borrow_mut();
            let src_key = norm(src);
            let dst_key = norm(dst);

            let Some(src_node) = state.nodes.get(&src_key).cloned() else {
                return Err(Error::SourceNotFound(src.to_path_buf()));
            };

            let target = if matches!(state.nodes.get(&dst_key), Some(MemNode::Dir)) {
                if dst_key == "/" {
                    format!("/{}", base_name(&src_key))
                } else {
                    format!("{dst_key}/{}", base_name(&src_key))
                }
            } else {
                dst_key
            };

            let prefix = format!("{src_key}/");
            let children = state
                .nodes
                .iter()
                .filter(|(k, _v)| k.starts_with(&prefix))
                .map(|(k, v)| (k[src_key.len()..].to_owned(), v.clone()))
                .collect::<Vec<_>>();

            state.ensure_parents(&target);
            state.nodes.insert(target.clone(), src_node);
            for (suffix, node) in children {
                state.nodes.insert(format!("{target}{suffix}"), node);
            }

            Ok(())
        }

        fn upload(&mut self, host_src: &Path, dst: &Path) -> Result<(), Error> {
            let bytes = fs::read(host_src)?;
            let mut state = self.state.borrow_mut();
            let key = norm(dst);
            state.ensure_parents(&key);
            state.nodes.insert(key, MemNode::File(bytes));
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

            let state = self.state.borrow();
            let prefix = if parent == "/" { "/".to_owned() } else { format!("{parent}/") };

            Ok(state
                .nodes
                .iter()
                .filter(|(k, _v)| k.starts_with(&prefix) && !k[prefix.len()..].contains('/'))
                .filter(|(k, _v)| matcher.is_match(base_name(k)))
                .map(|(k, v)| match v {
                    MemNode::Dir => format!("{k}/"),
                    MemNode::File(_) => k.clone(),
                })
                .collect())
        }

        fn feature_available(&self, feature: &str) -> bool {
            feature == "syslinux" && !self.state.borrow().no_syslinux_feature
        }

        fn write_device_at(&mut self, device: &str, data: &[u8], offset: u64) -> Result<(), Error> {
            self.state
                .borrow_mut()
                .raw_writes
                .push((device.to_owned(), offset, data.to_vec()));
            Ok(())
        }

        fn install_bootloader(&mut self, partition: &str, dir: &Path) -> Result<(), Error> {
            let mut state = self.state.borrow_mut();
            let dest_was_mounted = state.mounts.values().any(|dev| dev == partition);
            state.bootloader_installs.push(BootloaderInstall {
                partition: partition.to_owned(),
                dir: dir.to_path_buf(),
                dest_was_mounted,
            });
            Ok(())
        }

        fn shutdown(&mut self) -> Result<(), Error> {
            let mut state = self.state.borrow_mut();
            state.mounts.clear();
            state.shutdowns += 1;
            Ok(())
        }
    }
}
