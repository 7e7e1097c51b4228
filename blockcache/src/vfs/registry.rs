//! Path → open file registry and handle table.

use crate::error::{Error, Result};
use crate::vfs::file::File;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct Tables {
    by_path: HashMap<String, Arc<File>>,
    by_id: HashMap<u64, Arc<File>>,
    handles: HashMap<HandleId, Arc<File>>,
}

#[derive(Default)]
pub struct FileRegistry {
    tables: Mutex<Tables>,
    next_file: AtomicU64,
    next_handle: AtomicU64,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new handle on `path`, creating the file record on first
    /// open. The flag is true when the record was created.
    pub fn open_handle(&self, path: &str) -> (HandleId, Arc<File>, bool) {
        let handle = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let mut tables = self.tables();
        let (file, created) = match tables.by_path.get(path) {
            Some(file) => (file.clone(), false),
            None => {
                let id = self.next_file.fetch_add(1, Ordering::Relaxed) + 1;
                let file = Arc::new(File::new(id, path));
                tables.by_path.insert(path.to_string(), file.clone());
                tables.by_id.insert(id, file.clone());
                (file, true)
            }
        };
        file.state().handles.insert(handle);
        tables.handles.insert(handle, file.clone());
        (handle, file, created)
    }

    pub fn file(&self, handle: HandleId) -> Result<Arc<File>> {
        self.tables()
            .handles
            .get(&handle)
            .cloned()
            .ok_or(Error::BadHandle(handle.0))
    }

    /// Drop `handle`. Returns the file when that was its last handle; the
    /// file is then no longer registered.
    pub fn close_handle(&self, handle: HandleId) -> Result<Option<Arc<File>>> {
        let mut tables = self.tables();
        let file = tables
            .handles
            .remove(&handle)
            .ok_or(Error::BadHandle(handle.0))?;
        let last = {
            let mut state = file.state();
            state.handles.remove(&handle);
            state.handles.is_empty()
        };
        if !last {
            return Ok(None);
        }
        tables.by_id.remove(&file.id());
        if tables
            .by_path
            .get(file.path())
            .is_some_and(|f| Arc::ptr_eq(f, &file))
        {
            tables.by_path.remove(file.path());
        }
        Ok(Some(file))
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<File>> {
        self.tables().by_path.get(path).cloned()
    }

    pub fn by_id(&self, id: u64) -> Option<Arc<File>> {
        self.tables().by_id.get(&id).cloned()
    }

    pub fn files(&self) -> Vec<Arc<File>> {
        self.tables().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
