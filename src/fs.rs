//! Filesystem context attached to threads.
//!
//! The actual VFS lives elsewhere; from the scheduler's point of view a
//! thread's filesystem state is an opaque pair of paths that the thread owns
//! and that path resolution starts from.

use alloc::sync::Arc;

/// A thread's filesystem view, i.e. its root and working directory.
#[derive(Clone, Debug)]
pub struct FsContext {
    root: Arc<str>,
    pwd: Arc<str>,
}

impl FsContext {
    pub fn new(root: impl Into<Arc<str>>, pwd: impl Into<Arc<str>>) -> FsContext {
        FsContext {
            root: root.into(),
            pwd: pwd.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    pub fn set_pwd(&mut self, pwd: impl Into<Arc<str>>) {
        self.pwd = pwd.into();
    }
}
