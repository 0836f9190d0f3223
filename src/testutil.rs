//! Shared fixtures: a session over the in-memory backend, prepared in
//! update mode with an empty destination filesystem.

use std::{cell::RefCell, rc::Rc};

use tempfile::NamedTempFile;

use crate::{
    backend::mem::{install_state, MemBackend, MemState},
    session::Session,
    types::FsKind,
};

pub(crate) struct TestRig {
    pub(crate) state: Rc<RefCell<MemState>>,
    pub(crate) session: Session<MemBackend>,
    iso: NamedTempFile,
    _dest: NamedTempFile,
}

impl TestRig {
    pub(crate) fn update() -> Self {
        Self::update_with(|_state| {})
    }

    /// Like [`TestRig::update`], with a hook to adjust the backend
    /// state before the session connects.
    pub(crate) fn update_with(seed: impl FnOnce(&mut MemState)) -> Self {
        let iso = NamedTempFile::new().unwrap();
        let dest = NamedTempFile::new().unwrap();

        let state = Rc::new(RefCell::new(MemState::default()));

        {
            let mut st = state.borrow_mut();
            st.partitions.push("/dev/sda1".to_owned());
            st.fs_kinds.insert("/dev/sda1".to_owned(), FsKind::Vfat);
            st.seed_dir("/dest");
            st.seed_dir("/source");
            seed(&mut st);
        }

        install_state(&state);

        let mut session = Session::start(
            iso.path().to_path_buf(),
            dest.path().to_path_buf(),
            FsKind::Vfat,
        )
        .unwrap();
        session.prepare_for_update().unwrap();

        Self {
            state,
            session,
            iso,
            _dest: dest,
        }
    }

    pub(crate) fn iso_file_name(&self) -> String {
        self.iso
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    pub(crate) fn seed_file(&self, path: &str, content: &str) {
        self.state.borrow_mut().seed_file(path, content);
    }

    pub(crate) fn seed_dir(&self, path: &str) {
        self.state.borrow_mut().seed_dir(path);
    }

    pub(crate) fn file_text(&self, path: &str) -> Option<String> {
        self.state.borrow().file_text(path)
    }
}
