//! bootvm - run bootc OCI images as virtual machines
//!
//! bootvm turns bootable container (bootc) images into running VMs. Each
//! image digest gets one cache entry holding a bootable disk built by the
//! image's own installer; entries are guarded by advisory file locks so
//! concurrent invocations cooperate instead of corrupting each other.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  bootvm CLI                                  │
//! ├──────────────────────────────────────────────┤
//! │  ImageCache (flock-guarded entries)          │
//! ├──────────────────────────────────────────────┤
//! │  VmBackend: DomainBackend | SupervisedBackend│
//! ├──────────────────────────────────────────────┤
//! │  virsh / vfkit + gvproxy + relay proxy       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bootvm::cache::ImageCache;
//! use bootvm::config::Dirs;
//!
//! let dirs = Dirs::new().unwrap();
//! dirs.ensure().unwrap();
//! let cache = ImageCache::open(&dirs).unwrap();
//! for id in cache.list().unwrap() {
//!     println!("{}", id.short());
//! }
//! ```

#![warn(clippy::all)]

pub mod cache;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod disk;
pub mod error;
pub mod images;
pub mod lock;
pub mod monitor;
pub mod process;
pub mod proxy;
pub mod ssh;
pub mod vm;

// Re-export main types for convenience
pub use cache::{ImageCache, ImageId, ReadGuard, WriteGuard};
pub use config::Dirs;
pub use error::{Error, Result};
pub use lock::{CacheLock, LockMode};
pub use process::ChildProcess;
pub use proxy::{Endpoint, RelayProxy};
pub use vm::{create_backend, RunParams, RunState, VmBackend, VmInstance};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
