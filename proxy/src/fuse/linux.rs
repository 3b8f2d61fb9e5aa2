//! `fuser`-backed implementation of the on-demand socket directory.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, Request,
};
use libc::ENOENT;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{FuseConfig, PGSQL_SOCKET_SUFFIX};
use crate::dialer::Dial;
use crate::error::{MountError, MultiError};
use crate::instance_id::InstanceId;
use crate::mount::UnixMount;

use super::FuseMount;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;
const README_INO: u64 = 2;
const README_CONTENTS: &str = "Each directory here is a database instance identifier in short form.\nOpening <short_id>/.s.PGSQL.5432 connects you to that instance.\n";

#[derive(Clone)]
enum Node {
    Root,
    Readme,
    InstanceDir(InstanceId),
    Socket(InstanceId),
}

/// A provisioned on-demand socket: the bound mount (kept alive so `close`
/// can reach it), its accept-loop task, and the path handed out to
/// `readlink`.
struct ProvisionedSocket {
    path: camino::Utf8PathBuf,
    mount: Arc<UnixMount>,
    task: tokio::task::JoinHandle<()>,
}

struct Inner {
    nodes: RwLock<HashMap<u64, Node>>,
    children: RwLock<HashMap<(u64, String), u64>>,
    next_ino: AtomicU64,
    sockets: RwLock<HashMap<InstanceId, ProvisionedSocket>>,
    accessed: RwLock<Vec<InstanceId>>,
    socket_dir: camino::Utf8PathBuf,
    dialer: Arc<dyn Dial>,
    runtime: Handle,
}

struct PgsqlFs {
    inner: Arc<Inner>,
}

fn dir_attr(ino: u64) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn file_attr(ino: u64, size: u64) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size,
        blocks: 1,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::RegularFile,
        perm: 0o444,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn symlink_attr(ino: u64, target_len: u64) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size: target_len,
        blocks: 1,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::Symlink,
        perm: 0o777,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

impl Inner {
    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    fn node_ino(&self, parent: u64, name: &str, make: impl FnOnce(u64) -> Node) -> u64 {
        let key = (parent, name.to_string());
        if let Some(ino) = self.children.read().get(&key) {
            return *ino;
        }
        let ino = self.alloc_ino();
        self.nodes.write().insert(ino, make(ino));
        self.children.write().insert(key, ino);
        ino
    }

    /// Provisions (or returns the already-open) Unix-socket mount for
    /// `instance`, under `self.socket_dir`, and spawns its accept loop.
    fn ensure_socket(&self, instance: &InstanceId) -> Result<camino::Utf8PathBuf, MountError> {
        if let Some(entry) = self.sockets.read().get(instance) {
            return Ok(entry.path.clone());
        }

        let dialer = Arc::clone(&self.dialer);
        let instance_cloned = instance.clone();
        let socket_dir = self.socket_dir.clone();
        let mount = self
            .runtime
            .block_on(async move { UnixMount::bind(&instance_cloned, &socket_dir).await })?;
        let mount = Arc::new(mount);

        let path = mount.path().clone();
        let instance_for_task = instance.clone();
        let dialer_for_task = dialer;
        let mount_for_task = Arc::clone(&mount);
        let task = self.runtime.spawn(async move {
            accept_onto_dialer(instance_for_task, mount_for_task, dialer_for_task).await;
        });

        self.sockets.write().insert(
            instance.clone(),
            ProvisionedSocket {
                path: path.clone(),
                mount,
                task,
            },
        );
        self.accessed.write().push(instance.clone());
        Ok(path)
    }
}

async fn accept_onto_dialer(instance: InstanceId, mount: Arc<UnixMount>, dialer: Arc<dyn Dial>) {
    use crate::mount::{Accepted, Mount};
    loop {
        match mount.accept().await {
            Ok(Accepted::Unix(client)) => {
                let instance = instance.clone();
                let dialer = Arc::clone(&dialer);
                tokio::spawn(async move {
                    match dialer.dial(&instance).await {
                        Ok(server) => crate::splice::splice(client, server).await,
                        Err(e) => warn!(instance = %instance, error = %e, "dial failed for fuse-provisioned socket"),
                    }
                });
            }
            Ok(Accepted::Tcp(_, _)) => unreachable!("fuse sockets only ever accept unix streams"),
            Err(e) => {
                warn!(instance = %instance, error = %e, "fuse-provisioned listener closed");
                return;
            }
        }
    }
}

impl Filesystem for PgsqlFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };

        let parent_node = self.inner.nodes.read().get(&parent).cloned();
        match parent_node {
            Some(Node::Root) => {
                if name == "README" {
                    reply.entry(&TTL, &file_attr(README_INO, README_CONTENTS.len() as u64), 0);
                    return;
                }
                match InstanceId::from_short_form(name) {
                    Ok(id) => {
                        let ino = self
                            .inner
                            .node_ino(ROOT_INO, name, |ino| {
                                let _ = ino;
                                Node::InstanceDir(id.clone())
                            });
                        reply.entry(&TTL, &dir_attr(ino), 0);
                    }
                    Err(_) => reply.error(ENOENT),
                }
            }
            Some(Node::InstanceDir(id)) => {
                let suffix = PGSQL_SOCKET_SUFFIX;
                if name != suffix {
                    reply.error(ENOENT);
                    return;
                }
                match self.inner.ensure_socket(&id) {
                    Ok(target) => {
                        let ino = self
                            .inner
                            .node_ino(parent, name, |_| Node::Socket(id.clone()));
                        reply.entry(&TTL, &symlink_attr(ino, target.as_str().len() as u64), 0);
                    }
                    Err(e) => {
                        warn!(instance = %id, error = %e, "failed to provision on-demand socket");
                        reply.error(libc::EIO);
                    }
                }
            }
            _ => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.inner.nodes.read().get(&ino) {
            Some(Node::Root) => reply.attr(&TTL, &dir_attr(ROOT_INO)),
            Some(Node::Readme) => {
                reply.attr(&TTL, &file_attr(README_INO, README_CONTENTS.len() as u64))
            }
            Some(Node::InstanceDir(_)) => reply.attr(&TTL, &dir_attr(ino)),
            Some(Node::Socket(id)) => {
                let len = self
                    .inner
                    .sockets
                    .read()
                    .get(id)
                    .map(|entry| entry.path.as_str().len() as u64)
                    .unwrap_or(0);
                reply.attr(&TTL, &symlink_attr(ino, len));
            }
            None if ino == ROOT_INO => reply.attr(&TTL, &dir_attr(ROOT_INO)),
            None if ino == README_INO => {
                reply.attr(&TTL, &file_attr(README_INO, README_CONTENTS.len() as u64))
            }
            None => reply.error(ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        _size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino == README_INO {
            let bytes = README_CONTENTS.as_bytes();
            let offset = offset.max(0) as usize;
            reply.data(bytes.get(offset..).unwrap_or(&[]));
        } else {
            reply.error(ENOENT);
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let node = self.inner.nodes.read().get(&ino).cloned();
        match node {
            Some(Node::Socket(id)) => match self.inner.sockets.read().get(&id) {
                Some(entry) => reply.data(entry.path.as_str().as_bytes()),
                None => reply.error(ENOENT),
            },
            _ => reply.error(ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let node = self.inner.nodes.read().get(&ino).cloned();
        let entries: Vec<(u64, FileType, String)> = match node {
            Some(Node::Root) | None if ino == ROOT_INO => {
                let mut entries = vec![
                    (ROOT_INO, FileType::Directory, ".".to_string()),
                    (ROOT_INO, FileType::Directory, "..".to_string()),
                    (README_INO, FileType::RegularFile, "README".to_string()),
                ];
                for id in self.inner.accessed.read().iter() {
                    let short = id.short_form();
                    let child_ino = self.inner.node_ino(ROOT_INO, &short, |_| {
                        Node::InstanceDir(id.clone())
                    });
                    entries.push((child_ino, FileType::Directory, short));
                }
                entries
            }
            Some(Node::InstanceDir(id)) => {
                let mut entries = vec![
                    (ino, FileType::Directory, ".".to_string()),
                    (ROOT_INO, FileType::Directory, "..".to_string()),
                ];
                if let Ok(target) = self.inner.ensure_socket(&id) {
                    let sock_ino = self
                        .inner
                        .node_ino(ino, PGSQL_SOCKET_SUFFIX, |_| Node::Socket(id.clone()));
                    let _ = target;
                    entries.push((sock_ino, FileType::Symlink, PGSQL_SOCKET_SUFFIX.to_string()));
                }
                entries
            }
            _ => {
                reply.error(ENOENT);
                return;
            }
        };

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

pub struct LinuxFuseMount {
    inner: Arc<Inner>,
    session: Mutex<Option<BackgroundSession>>,
}

#[async_trait::async_trait]
impl FuseMount for LinuxFuseMount {
    async fn close(&self) -> Result<(), MultiError> {
        if let Some(session) = self.session.lock().expect("session mutex poisoned").take() {
            drop(session);
        }
        info!("fuse filesystem unmounted");

        // Unmounting stops new lookups from provisioning further sockets,
        // but every socket `ensure_socket` already opened keeps its accept
        // loop running and its file bound on disk until it's torn down
        // here.
        let provisioned: Vec<ProvisionedSocket> =
            self.inner.sockets.write().drain().map(|(_, entry)| entry).collect();
        for entry in provisioned {
            use crate::mount::Mount;
            entry.mount.close();
            entry.task.abort();
        }
        Ok(())
    }
}

pub async fn mount(
    config: FuseConfig,
    dialer: Arc<dyn Dial>,
) -> Result<Box<dyn super::FuseMount>, MountError> {
    tokio::fs::create_dir_all(config.mount_root.as_std_path())
        .await
        .map_err(|e| MountError::Fuse(format!("creating mount root: {e}")))?;
    tokio::fs::create_dir_all(config.socket_dir.as_std_path())
        .await
        .map_err(|e| MountError::Fuse(format!("creating socket dir: {e}")))?;

    let mut nodes = HashMap::new();
    nodes.insert(ROOT_INO, Node::Root);
    nodes.insert(README_INO, Node::Readme);

    let inner = Arc::new(Inner {
        nodes: RwLock::new(nodes),
        children: RwLock::new(HashMap::new()),
        next_ino: AtomicU64::new(3),
        sockets: RwLock::new(HashMap::new()),
        accessed: RwLock::new(Vec::new()),
        socket_dir: config.socket_dir,
        dialer,
        runtime: Handle::current(),
    });

    let fs = PgsqlFs {
        inner: Arc::clone(&inner),
    };

    let mount_root = config.mount_root.clone();
    let session = tokio::task::spawn_blocking(move || {
        fuser::spawn_mount2(fs, mount_root.as_std_path(), &[])
    })
    .await
    .map_err(|e| MountError::Fuse(format!("mount task panicked: {e}")))?
    .map_err(|e| MountError::Fuse(format!("fuse mount failed: {e}")))?;

    Ok(Box::new(LinuxFuseMount {
        inner,
        session: Mutex::new(Some(session)),
    }))
}
