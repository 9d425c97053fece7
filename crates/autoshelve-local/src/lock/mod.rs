mod file;

pub use file::{FileLock, LockGuard};
