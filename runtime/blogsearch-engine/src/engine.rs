//! The engine handle: one-time library initialization plus the scratch
//! directory that database images are materialized into.
//!
//! The scratch directory plays the role of a private filesystem: every
//! connection gets its own backing file under it, read back whole on
//! export and unlinked on close.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Once;

use rusqlite::ffi;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::Result;

static ENGINE_INIT: Once = Once::new();

/// Engine construction options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for database files. When unset, a private temporary
    /// directory is created and removed when the engine is dropped.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

/// One loaded engine instance.
///
/// Cheap to clone; clones share the scratch root. Connections hold a
/// clone so the backing file outlives the handle that created it.
#[derive(Clone)]
pub struct Engine {
    vfs: Rc<Vfs>,
}

impl Engine {
    pub fn load(config: EngineConfig) -> Result<Self> {
        ENGINE_INIT.call_once(|| {
            // SAFETY: first engine call in the process; redundant
            // initialization is tolerated by the library.
            unsafe {
                ffi::sqlite3_initialize();
            }
        });
        let vfs = Vfs::new(config.scratch_dir)?;
        tracing::debug!(root = %vfs.root().display(), "engine loaded");
        Ok(Self { vfs: Rc::new(vfs) })
    }

    /// Open a connection, seeding its backing file from `image` when one
    /// is given. Without an image the connection starts empty.
    pub fn open(&self, image: Option<&[u8]>) -> Result<Connection> {
        let file = self.vfs.fresh_path();
        if let Some(bytes) = image {
            fs::write(&file, bytes)?;
        }
        Connection::open(self.clone(), file)
    }

    pub(crate) fn remove_file(&self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

enum VfsRoot {
    Scratch(tempfile::TempDir),
    Pinned(PathBuf),
}

struct Vfs {
    root: VfsRoot,
    next_file: Cell<u64>,
}

impl Vfs {
    fn new(dir: Option<PathBuf>) -> Result<Self> {
        let root = match dir {
            Some(path) => {
                fs::create_dir_all(&path)?;
                VfsRoot::Pinned(path)
            }
            None => VfsRoot::Scratch(tempfile::tempdir()?),
        };
        Ok(Self {
            root,
            next_file: Cell::new(0),
        })
    }

    fn root(&self) -> &Path {
        match &self.root {
            VfsRoot::Scratch(dir) => dir.path(),
            VfsRoot::Pinned(path) => path,
        }
    }

    fn fresh_path(&self) -> PathBuf {
        let serial = self.next_file.get();
        self.next_file.set(serial + 1);
        self.root()
            .join(format!("dbfile_{}_{serial}", std::process::id()))
    }
}
