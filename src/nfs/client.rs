//! Entry point of the file API: resolves URLs to file handles and keeps one
//! [`NfsFile`] per `(server, path)` so every user of a path shares its
//! caches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use super::buffer::FileIo;
use super::fattr::Fattr;
use super::file::NfsFile;
use super::proto::{self, Nfs3};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::rpc::{
    ConnectionRegistry, Credential, Endpoint, RpcClient, RpcHandler, TransportKind,
};
use crate::url::NfsUrl;
use crate::xdr::nfs3::dir::CREATE3resok;
use crate::xdr::nfs3::{self, nfs_fh3, post_op_attr, post_op_fh3};
use crate::xdr::{mount, portmap};

pub(crate) struct ClientShared {
    me: Weak<ClientShared>,
    config: ClientConfig,
    registry: ConnectionRegistry,
    credential: Credential,
    handler: Option<Arc<dyn RpcHandler>>,
    files: Mutex<HashMap<(String, String), Arc<NfsFile>>>,
    /// NFS clients by server, over the transport that answered.
    servers: AsyncMutex<HashMap<String, Nfs3>>,
}

impl ClientShared {
    fn cached(&self, url: &NfsUrl) -> Option<Arc<NfsFile>> {
        let key = (url.server(), url.path().to_string());
        self.files.lock().unwrap_or_else(PoisonError::into_inner).get(&key).cloned()
    }

    fn insert(&self, file: NfsFile) -> Arc<NfsFile> {
        let key = (file.url().server(), file.url().path().to_string());
        let file = Arc::new(file);
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, file.clone());
        file
    }

    pub(crate) fn forget(&self, url: &NfsUrl) {
        let key = (url.server(), url.path().to_string());
        self.files.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
    }

    fn file(&self, url: NfsUrl, nfs: Nfs3, fh: nfs_fh3, attr: &post_op_attr) -> NfsFile {
        let attr = attr.attributes().map(Fattr::from_v3);
        let io = FileIo::new(nfs, fh, self.config.write_behind, attr);
        NfsFile::new(self.me.clone(), url, io, self.config.clone())
    }

    pub(crate) async fn open(&self, url: &NfsUrl) -> Result<Arc<NfsFile>> {
        if let Some(file) = self.cached(url) {
            return Ok(file);
        }
        let nfs = self.nfs(url).await?;
        let (fh, attr) = self.resolve(&nfs, url).await?;
        let file = self.file(url.clone(), nfs, fh, &attr);

        let key = (url.server(), url.path().to_string());
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(files.entry(key).or_insert_with(|| Arc::new(file)).clone())
    }

    /// Registers a file just made by CREATE or MKDIR in `dir`.
    pub(crate) async fn adopt(
        &self,
        nfs: &Nfs3,
        dir: &nfs_fh3,
        url: NfsUrl,
        res: CREATE3resok,
    ) -> Result<Arc<NfsFile>> {
        let (fh, attr) = match res.obj {
            post_op_fh3::handle(fh) => (fh, res.obj_attributes),
            post_op_fh3::Void => {
                let found = nfs.lookup(dir, url.name()).await?;
                (found.object, found.obj_attributes)
            }
        };
        Ok(self.insert(self.file(url, nfs.clone(), fh, &attr)))
    }

    /// Handle and attributes of the object at `url`.
    ///
    /// A cached parent directory is asked first. Otherwise the path is
    /// looked up from the WebNFS public handle, and if the server does not
    /// offer one, from the root of the longest exported prefix of the path.
    async fn resolve(&self, nfs: &Nfs3, url: &NfsUrl) -> Result<(nfs_fh3, post_op_attr)> {
        if let Some(parent) = url.parent().and_then(|parent| self.cached(&parent)) {
            let found = nfs.lookup(parent.fh(), url.name()).await?;
            return Ok((found.object, found.obj_attributes));
        }

        let public = if url.is_root() {
            nfs.getattr(&nfs_fh3::default())
                .await
                .map(|attr| (nfs_fh3::default(), post_op_attr::attributes(attr)))
        } else {
            nfs.lookup_public(url.path()).await.map(|found| (found.object, found.obj_attributes))
        };
        match public {
            Ok(found) => return Ok(found),
            Err(e) => debug!("Public handle lookup of {} failed: {}", url, e),
        }

        let mount = self.mount_client(url, nfs.rpc().connection().endpoint().kind).await?;
        let components: Vec<&str> = url.components().collect();
        let mut last_err = Error::Nfs(nfs3::nfsstat3::NFS3ERR_NOENT);
        for split in (0..=components.len()).rev() {
            let export = format!("/{}", components[..split].join("/"));
            let root = match proto::mount(&mount, &export).await {
                Ok(root) => root,
                Err(e @ Error::Nfs(_)) => {
                    last_err = e;
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!("Mounted {} on {}", export, url.server());

            let mut fh = root;
            let mut attr = post_op_attr::Void;
            for name in &components[split..] {
                let found = nfs.lookup(&fh, name).await?;
                fh = found.object;
                attr = found.obj_attributes;
            }
            if let post_op_attr::Void = attr {
                attr = post_op_attr::attributes(nfs.getattr(&fh).await?);
            }
            return Ok((fh, attr));
        }
        Err(last_err)
    }

    /// The NFS client for the server of `url`. Without a transport in the
    /// URL the configured one is tried first and the other one after it.
    async fn nfs(&self, url: &NfsUrl) -> Result<Nfs3> {
        let mut servers = self.servers.lock().await;
        if let Some(nfs) = servers.get(&url.server()) {
            if !nfs.rpc().connection().is_failed() {
                return Ok(nfs.clone());
            }
        }

        let kinds = match url.transport() {
            Some(kind) => vec![kind],
            None => vec![self.config.transport, self.config.transport.fallback()],
        };
        let mut last_err = None;
        for (i, &kind) in kinds.iter().enumerate() {
            let endpoint = Endpoint::new(url.host(), url.port(), kind);
            let rpc = self.rpc(endpoint, nfs3::PROGRAM, nfs3::VERSION, self.credential.clone());
            if i + 1 < kinds.len() {
                let ping = rpc.clone().with_timeout(self.config.timeout, 1);
                match ping.null().await {
                    Ok(()) => {}
                    Err(
                        e @ (Error::Timeout { .. } | Error::ConnectionFailed { .. } | Error::Io(_)),
                    ) => {
                        info!("{} over {} unreachable: {}", url.server(), kind, e);
                        last_err = Some(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let nfs = Nfs3::new(rpc);
            servers.insert(url.server(), nfs.clone());
            return Ok(nfs);
        }
        Err(last_err.unwrap_or_else(|| Error::ConnectionFailed {
            server: url.server(),
            reason: String::from("no transport"),
        }))
    }

    /// MOUNT client found through the portmapper of the server of `url`.
    async fn mount_client(&self, url: &NfsUrl, kind: TransportKind) -> Result<RpcClient> {
        let pmap = self.rpc(
            Endpoint::new(url.host(), portmap::PMAP_PORT, kind),
            portmap::PROGRAM,
            portmap::VERSION,
            Credential::None,
        );
        let port = proto::getport(&pmap, mount::PROGRAM, mount::VERSION, kind.ipproto()).await?;
        debug!("MOUNT of {} is on port {}", url.host(), port);

        let credential = match &self.credential {
            Credential::Gss(_) => Credential::unix(
                &self.config.machine_name,
                self.config.uid,
                self.config.gid,
                &self.config.gids,
            ),
            other => other.clone(),
        };
        let endpoint = Endpoint::new(url.host(), port, kind);
        Ok(self.rpc(endpoint, mount::PROGRAM, mount::VERSION, credential))
    }

    fn rpc(&self, endpoint: Endpoint, prog: u32, vers: u32, credential: Credential) -> RpcClient {
        let connection = self.registry.get(&endpoint);
        let rpc = RpcClient::new(connection, prog, vers, credential, &self.config);
        match &self.handler {
            Some(handler) => rpc.with_handler(handler.clone()),
            None => rpc,
        }
    }
}

/// Process-scoped NFS client: connections, resolved files and settings.
#[derive(Clone)]
pub struct NfsClient {
    shared: Arc<ClientShared>,
}

impl NfsClient {
    /// A client over real sockets with AUTH_UNIX credentials from `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> NfsClientBuilder {
        NfsClientBuilder { config, registry: None, credential: None, handler: None }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Opens the file or directory at `url`. Every open of the same path
    /// returns the same object.
    pub async fn open(&self, url: &str) -> Result<Arc<NfsFile>> {
        self.open_url(&NfsUrl::parse(url)?).await
    }

    pub async fn open_url(&self, url: &NfsUrl) -> Result<Arc<NfsFile>> {
        self.shared.open(url).await
    }

    /// Like [`open`](Self::open), but a missing file is `None`.
    pub async fn lookup(&self, url: &str) -> Result<Option<Arc<NfsFile>>> {
        match self.open(url).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, url: &str) -> Result<bool> {
        match self.lookup(url).await? {
            Some(file) => file.exists().await,
            None => Ok(false),
        }
    }

    /// Creates the regular file at `url` in its existing parent directory.
    pub async fn create(&self, url: &str, mode: u32) -> Result<Arc<NfsFile>> {
        let (parent, name) = self.parent_of(url).await?;
        parent.create(&name, mode).await
    }

    pub async fn mkdir(&self, url: &str, mode: u32) -> Result<Arc<NfsFile>> {
        let (parent, name) = self.parent_of(url).await?;
        parent.mkdir(&name, mode).await
    }

    async fn parent_of(&self, url: &str) -> Result<(Arc<NfsFile>, String)> {
        let url = NfsUrl::parse(url)?;
        let parent = url.parent().ok_or_else(|| Error::InvalidUrl {
            url: url.to_string(),
            reason: String::from("the root has no parent"),
        })?;
        Ok((self.open_url(&parent).await?, url.name().to_string()))
    }

    /// Closes every open file and ends the GSS contexts of the servers.
    pub async fn close(&self) -> Result<()> {
        let files: Vec<Arc<NfsFile>> = {
            let mut files = self.shared.files.lock().unwrap_or_else(PoisonError::into_inner);
            files.drain().map(|(_, file)| file).collect()
        };
        let mut res = Ok(());
        for file in files {
            if let Err(e) = file.close().await {
                res = Err(e);
            }
        }
        let servers: Vec<Nfs3> =
            self.shared.servers.lock().await.drain().map(|(_, nfs)| nfs).collect();
        for nfs in servers {
            nfs.rpc().close().await;
        }
        res
    }
}

impl std::fmt::Debug for NfsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsClient")
            .field("config", &self.shared.config)
            .field("credential", &self.shared.credential.flavor())
            .finish()
    }
}

pub struct NfsClientBuilder {
    config: ClientConfig,
    registry: Option<ConnectionRegistry>,
    credential: Option<Credential>,
    handler: Option<Arc<dyn RpcHandler>>,
}

impl NfsClientBuilder {
    /// Connections come from `registry` instead of fresh sockets.
    pub fn registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> NfsClient {
        let config = self.config;
        let registry =
            self.registry.unwrap_or_else(|| ConnectionRegistry::new(config.idle_timeout));
        let credential = self.credential.unwrap_or_else(|| {
            Credential::unix(&config.machine_name, config.uid, config.gid, &config.gids)
        });
        let handler = self.handler;
        let shared = Arc::new_cyclic(|me| ClientShared {
            me: me.clone(),
            config,
            registry,
            credential,
            handler,
            files: Mutex::new(HashMap::new()),
            servers: AsyncMutex::new(HashMap::new()),
        });
        NfsClient { shared }
    }
}
