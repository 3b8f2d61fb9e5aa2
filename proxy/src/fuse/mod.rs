//! On-demand Socket Mount provisioning through a user-space filesystem.
//!
//! Each lookup of `<short_id>/.s.PGSQL.5432` materializes a Unix-socket
//! listener for the corresponding instance the first time it's touched,
//! and exposes it to the filesystem as a symlink into a separate backing
//! directory — the same way a real on-demand socket directory would, so a
//! client `connect()`ing through the FUSE path transparently reaches the
//! backing socket via normal symlink resolution.

#[cfg(all(target_os = "linux", feature = "fuse"))]
mod linux;

use std::sync::Arc;

use crate::config::FuseConfig;
use crate::dialer::Dial;
use crate::error::MountError;

/// A mounted on-demand socket directory. `close()` unmounts the
/// filesystem and closes every on-demand Socket Mount it provisioned.
#[async_trait::async_trait]
pub trait FuseMount: Send + Sync {
    async fn close(&self) -> Result<(), crate::error::MultiError>;
}

#[cfg(all(target_os = "linux", feature = "fuse"))]
pub async fn mount(config: FuseConfig, dialer: Arc<dyn Dial>) -> Result<Box<dyn FuseMount>, MountError> {
    linux::mount(config, dialer).await
}

#[cfg(not(all(target_os = "linux", feature = "fuse")))]
pub async fn mount(
    _config: FuseConfig,
    _dialer: Arc<dyn Dial>,
) -> Result<Box<dyn FuseMount>, MountError> {
    Err(MountError::FuseUnsupported)
}
