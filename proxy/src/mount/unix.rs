use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tokio::net::UnixListener;
use tracing::warn;

use crate::config::PGSQL_SOCKET_SUFFIX;
use crate::error::MountError;
use crate::instance_id::InstanceId;

use super::{Accepted, Mount};

pub struct UnixMount {
    listener: Mutex<Option<Arc<UnixListener>>>,
    path: Utf8PathBuf,
}

impl UnixMount {
    pub async fn bind(instance: &InstanceId, dir: &Utf8PathBuf) -> Result<Self, MountError> {
        let instance_dir = dir.join(instance.short_form());
        tokio::fs::create_dir_all(instance_dir.as_std_path())
            .await
            .map_err(|source| MountError::Unix {
                path: instance_dir.clone(),
                source,
            })?;
        if let Err(e) = tokio::fs::set_permissions(
            instance_dir.as_std_path(),
            std::fs::Permissions::from_mode(0o777),
        )
        .await
        {
            warn!(dir = %instance_dir, error = %e, "failed to relax permissions on socket directory");
        }

        let path = instance_dir.join(PGSQL_SOCKET_SUFFIX);
        let _ = tokio::fs::remove_file(path.as_std_path()).await;

        let listener =
            UnixListener::bind(path.as_std_path()).map_err(|source| MountError::Unix {
                path: path.clone(),
                source,
            })?;

        if let Err(e) =
            std::fs::set_permissions(path.as_std_path(), std::fs::Permissions::from_mode(0o777))
        {
            warn!(path = %path, error = %e, "failed to relax permissions on socket file");
        }

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            path,
        })
    }

    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }
}

#[async_trait]
impl Mount for UnixMount {
    async fn accept(&self) -> std::io::Result<Accepted> {
        let listener = match self.listener.lock().as_ref() {
            Some(listener) => Arc::clone(listener),
            None => return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "mount closed")),
        };
        let (stream, _addr) = listener.accept().await?;
        Ok(Accepted::Unix(stream))
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path)
    }

    fn close(&self) {
        self.listener.lock().take();
        // Best-effort: a future bind for the same instance already
        // tolerates a stale socket file, but removing it here means a
        // client that stats the path right after close sees it gone
        // rather than a socket nothing is listening on.
        let _ = std::fs::remove_file(self.path.as_std_path());
    }
}
