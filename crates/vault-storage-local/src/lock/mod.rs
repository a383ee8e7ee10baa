mod file;

pub use file::{LockError, LockGuard, LockManager, LockMode};
