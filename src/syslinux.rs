//! Boot-loader installation: the raw boot-record write, the menu
//! support files and the syslinux run against the unmounted partition.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    backend::Backend,
    ops,
    session::{MountName, Session},
    types::Error,
};

const DEFAULT_ROOT: &str = "/usr/share/syslinux";
const DEFAULT_MBR_FILE: &str = "mbr.bin";
const DEFAULT_MENU_FILES: &[&str] = &["vesamenu.c32", "libcom32.c32", "libutil.c32", "menu.c32"];

const DEST_BOOT_SUBDIR: &str = "syslinux";

/// Where the boot loader's host-side support files live and which of
/// them to install.
#[derive(Clone, Debug)]
pub(crate) struct SupportFiles {
    pub(crate) root: PathBuf,
    pub(crate) mbr_file: Option<String>,
    pub(crate) menu_files: Vec<String>,
}

impl Default for SupportFiles {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            mbr_file: Some(DEFAULT_MBR_FILE.to_owned()),
            menu_files: DEFAULT_MENU_FILES
                .iter()
                .map(|&name| name.to_owned())
                .collect(),
        }
    }
}

impl SupportFiles {
    /// Resolves a support-file name: an existing absolute path is used
    /// as-is, a bare name is looked up under the support root.
    fn file_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() && path.exists() {
            return Some(path.to_path_buf());
        }

        let under_root = self.root.join(name);
        under_root.exists().then_some(under_root)
    }
}

/// Installs the boot loader on the destination: writes the boot-record
/// blob at offset 0 of the device, uploads the menu support files and
/// runs the installer against the unmounted partition.
///
/// The partition is remounted afterwards, whatever the support-file
/// uploads did.
pub(crate) fn install<B: Backend>(
    session: &mut Session<B>,
    support: &SupportFiles,
) -> Result<(), Error> {
    let device = session.dest_device()?.to_owned();

    if !session.backend.feature_available("syslinux") {
        return Err(Error::UnsupportedBackend("syslinux"));
    }

    if let Some(name) = &support.mbr_file {
        let path = support
            .file_path(name)
            .ok_or_else(|| Error::SourceNotFound(PathBuf::from(name)))?;

        info!("Writing the boot record from {}", path.display());

        // Raw overwrite of the whole boot sector, the blob is trusted
        // to leave the partition-entry bytes alone.
        let blob = fs::read(path)?;
        session.backend.write_device_at(&device, &blob, 0)?;
    }

    session.mount(MountName::Dest)?;

    for name in &support.menu_files {
        let Some(path) = support.file_path(name) else {
            warn!("{name} not found under {}, skipping it", support.root.display());
            continue;
        };

        let res = ops::upload_file(session, &path, DEST_BOOT_SUBDIR);
        if let Err(e) = res {
            warn!("Couldn't stage {name}: {e}");
        }
    }

    // syslinux wants the raw partition, so the filesystem has to come
    // down around the install.
    let partition = session.dest_partition()?.to_owned();
    let boot_dir = PathBuf::from("/").join(DEST_BOOT_SUBDIR);

    debug!("Installing the boot loader on {partition}");

    session.unmount(MountName::Dest)?;
    session.backend.install_bootloader(&partition, &boot_dir)?;
    session.mount(MountName::Dest)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use test_log::test;

    use crate::{testutil::TestRig, types::Error};

    use super::{install, SupportFiles};

    fn support_root(menu_files: &[&str]) -> TempDir {
        let root = TempDir::new().unwrap();

        fs::write(root.path().join("mbr.bin"), b"\xfa\x31\xc0").unwrap();
        for name in menu_files {
            fs::write(root.path().join(name), b"menu module").unwrap();
        }

        root
    }

    fn support(root: &TempDir) -> SupportFiles {
        SupportFiles {
            root: root.path().to_path_buf(),
            ..SupportFiles::default()
        }
    }

    #[test]
    fn install_brackets_with_unmount_and_remount() {
        let root = support_root(&["vesamenu.c32", "libcom32.c32", "libutil.c32", "menu.c32"]);
        let mut rig = TestRig::update();

        install(&mut rig.session, &support(&root)).unwrap();

        let st = rig.state.borrow();

        let run = &st.bootloader_installs[0];
        assert_eq!(run.partition, "/dev/sda1");
        assert_eq!(run.dir.to_str(), Some("/syslinux"));
        assert!(!run.dest_was_mounted);

        // Remounted afterwards.
        assert_eq!(st.mounts.get("/dest"), Some(&"/dev/sda1".to_owned()));
    }

    #[test]
    fn install_writes_the_boot_record_at_offset_zero() {
        let root = support_root(&[]);
        let mut rig = TestRig::update();

        install(&mut rig.session, &support(&root)).unwrap();

        let st = rig.state.borrow();
        assert_eq!(
            st.raw_writes[0],
            ("/dev/sda".to_owned(), 0, b"\xfa\x31\xc0".to_vec())
        );
    }

    #[test]
    fn missing_menu_files_are_skipped() {
        let root = support_root(&["vesamenu.c32"]);
        let mut rig = TestRig::update();

        install(&mut rig.session, &support(&root)).unwrap();

        assert!(rig.file_text("/dest/syslinux/vesamenu.c32").is_some());
        assert!(rig.file_text("/dest/syslinux/menu.c32").is_none());
    }

    #[test]
    fn missing_boot_record_is_fatal() {
        let root = TempDir::new().unwrap();
        let mut rig = TestRig::update();

        assert!(matches!(
            install(&mut rig.session, &support(&root)),
            Err(Error::SourceNotFound(_))
        ));
        assert!(rig.state.borrow().bootloader_installs.is_empty());
    }

    #[test]
    fn missing_backend_feature_is_reported() {
        let root = support_root(&[]);
        let mut rig = TestRig::update_with(|st| st.no_syslinux_feature = true);

        assert!(matches!(
            install(&mut rig.session, &support(&root)),
            Err(Error::UnsupportedBackend("syslinux"))
        ));
    }
}
