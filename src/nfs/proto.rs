//! Typed NFS version 3, MOUNT and PORTMAP calls on top of [`RpcClient`].
//!
//! Each NFS procedure decodes the `nfsstat3` that leads its reply and turns
//! anything but `NFS3_OK` into [`Error::Nfs`]. The attributes some servers
//! attach to failure replies are not decoded.

use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::rpc::RpcClient;
use crate::xdr::mount::{mountres3_ok, mountstat3, MountProgram};
use crate::xdr::nfs3::dir::{
    createhow3, CREATE3args, CREATE3resok, LOOKUP3resok, MKDIR3args, READDIR3args,
    READDIR3resok, READLINK3resok, RENAME3args, RENAME3resok,
};
use crate::xdr::nfs3::file::{
    stable_how, ACCESS3args, ACCESS3resok, COMMIT3args, COMMIT3resok, GETATTR3resok, READ3args,
    READ3resok, WRITE3args, WRITE3resok,
};
use crate::xdr::nfs3::fs::fsinfo3;
use crate::xdr::nfs3::{
    cookie3, cookieverf3, diropargs3, fattr3, nfs_fh3, nfsstat3, sattr3, wcc_data, NFSProgram,
};
use crate::xdr::portmap::{mapping, PortmapProgram};
use crate::xdr::{portmap, Deserialize, Serialize, XdrBuffer};

/// NFS version 3 procedures on one server.
#[derive(Clone, Debug)]
pub struct Nfs3 {
    rpc: RpcClient,
}

impl Nfs3 {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn server(&self) -> &str {
        self.rpc.connection().server()
    }

    async fn call<A, R>(&self, proc: NFSProgram, args: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: Deserialize + Default,
    {
        let mut results = self.rpc.call(proc as u32, args).await?;
        check_status(&mut results, proc)?;
        results.decode()
    }

    pub async fn null(&self) -> Result<()> {
        self.rpc.null().await
    }

    pub async fn getattr(&self, fh: &nfs_fh3) -> Result<fattr3> {
        let res: GETATTR3resok = self.call(NFSProgram::NFSPROC3_GETATTR, fh).await?;
        Ok(res.obj_attributes)
    }

    pub async fn lookup(&self, dir: &nfs_fh3, name: &str) -> Result<LOOKUP3resok> {
        let args = diropargs3 { dir: dir.clone(), name: name.into() };
        self.call(NFSProgram::NFSPROC3_LOOKUP, &args).await
    }

    /// Multi-component LOOKUP relative to the WebNFS public handle, which
    /// is the empty handle in version 3.
    pub async fn lookup_public(&self, path: &str) -> Result<LOOKUP3resok> {
        self.lookup(&nfs_fh3::default(), path).await
    }

    pub async fn access(&self, fh: &nfs_fh3, access: u32) -> Result<ACCESS3resok> {
        let args = ACCESS3args { object: fh.clone(), access };
        self.call(NFSProgram::NFSPROC3_ACCESS, &args).await
    }

    pub async fn readlink(&self, fh: &nfs_fh3) -> Result<READLINK3resok> {
        self.call(NFSProgram::NFSPROC3_READLINK, fh).await
    }

    pub async fn read(&self, fh: &nfs_fh3, offset: u64, count: u32) -> Result<READ3resok> {
        let args = READ3args { file: fh.clone(), offset, count };
        let res: READ3resok = self.call(NFSProgram::NFSPROC3_READ, &args).await?;
        if res.data.len() != res.count as usize {
            return Err(Error::Protocol(format!(
                "READ reply claims {} bytes but carries {}",
                res.count,
                res.data.len()
            )));
        }
        Ok(res)
    }

    pub async fn write(
        &self,
        fh: &nfs_fh3,
        offset: u64,
        data: &[u8],
        stable: stable_how,
    ) -> Result<WRITE3resok> {
        let args = WRITE3args {
            file: fh.clone(),
            offset,
            count: data.len() as u32,
            stable,
            data: data.to_vec(),
        };
        self.call(NFSProgram::NFSPROC3_WRITE, &args).await
    }

    pub async fn commit(&self, fh: &nfs_fh3, offset: u64, count: u32) -> Result<COMMIT3resok> {
        let args = COMMIT3args { file: fh.clone(), offset, count };
        self.call(NFSProgram::NFSPROC3_COMMIT, &args).await
    }

    pub async fn create(&self, dir: &nfs_fh3, name: &str, mode: u32) -> Result<CREATE3resok> {
        let args = CREATE3args {
            location: diropargs3 { dir: dir.clone(), name: name.into() },
            how: createhow3::UNCHECKED(sattr3::with_mode(mode)),
        };
        self.call(NFSProgram::NFSPROC3_CREATE, &args).await
    }

    pub async fn mkdir(&self, dir: &nfs_fh3, name: &str, mode: u32) -> Result<CREATE3resok> {
        let args = MKDIR3args {
            location: diropargs3 { dir: dir.clone(), name: name.into() },
            attributes: sattr3::with_mode(mode),
        };
        self.call(NFSProgram::NFSPROC3_MKDIR, &args).await
    }

    pub async fn remove(&self, dir: &nfs_fh3, name: &str) -> Result<wcc_data> {
        let args = diropargs3 { dir: dir.clone(), name: name.into() };
        self.call(NFSProgram::NFSPROC3_REMOVE, &args).await
    }

    pub async fn rmdir(&self, dir: &nfs_fh3, name: &str) -> Result<wcc_data> {
        let args = diropargs3 { dir: dir.clone(), name: name.into() };
        self.call(NFSProgram::NFSPROC3_RMDIR, &args).await
    }

    pub async fn rename(
        &self,
        from_dir: &nfs_fh3,
        from: &str,
        to_dir: &nfs_fh3,
        to: &str,
    ) -> Result<RENAME3resok> {
        let args = RENAME3args {
            from: diropargs3 { dir: from_dir.clone(), name: from.into() },
            to: diropargs3 { dir: to_dir.clone(), name: to.into() },
        };
        self.call(NFSProgram::NFSPROC3_RENAME, &args).await
    }

    pub async fn readdir(
        &self,
        dir: &nfs_fh3,
        cookie: cookie3,
        cookieverf: cookieverf3,
        count: u32,
    ) -> Result<READDIR3resok> {
        let args = READDIR3args { dir: dir.clone(), cookie, cookieverf, count };
        self.call(NFSProgram::NFSPROC3_READDIR, &args).await
    }

    pub async fn fsinfo(&self, fh: &nfs_fh3) -> Result<fsinfo3> {
        self.call(NFSProgram::NFSPROC3_FSINFO, fh).await
    }
}

fn check_status(results: &mut XdrBuffer, proc: NFSProgram) -> Result<()> {
    let status: nfsstat3 = results.decode()?;
    if status != nfsstat3::NFS3_OK {
        debug!("{:?} failed: {:?}", proc, status);
        return Err(Error::Nfs(status));
    }
    Ok(())
}

/// Asks the portmapper behind `rpc` for the port of `prog`/`vers` over
/// `protocol`. A zero port means the program is not registered.
pub async fn getport(rpc: &RpcClient, prog: u32, vers: u32, protocol: u32) -> Result<u16> {
    let args = mapping { prog, vers, prot: protocol, port: 0 };
    let mut results = rpc.call(PortmapProgram::PMAPPROC_GETPORT as u32, &args).await?;
    let port = results.get_uint()?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::Rejected(format!(
            "program {} version {} is not registered with {} (port {})",
            prog,
            vers,
            rpc.connection().server(),
            portmap::PMAP_PORT
        )));
    }
    Ok(port as u16)
}

/// MNT: the root handle of the export at `path`.
pub async fn mount(rpc: &RpcClient, path: &str) -> Result<nfs_fh3> {
    let mut results = rpc.call(MountProgram::MOUNTPROC3_MNT as u32, path.as_bytes()).await?;
    let status: mountstat3 = results.decode()?;
    if status != mountstat3::MNT3_OK {
        debug!("MNT {} failed: {:?}", path, status);
        return Err(Error::Nfs(mount_error(status)));
    }
    let ok: mountres3_ok = results.decode()?;
    Ok(nfs_fh3::from(ok.fhandle))
}

/// Mount failures are reported with the matching NFS status.
fn mount_error(status: mountstat3) -> nfsstat3 {
    match status {
        mountstat3::MNT3_OK => nfsstat3::NFS3_OK,
        mountstat3::MNT3ERR_PERM => nfsstat3::NFS3ERR_PERM,
        mountstat3::MNT3ERR_NOENT => nfsstat3::NFS3ERR_NOENT,
        mountstat3::MNT3ERR_IO => nfsstat3::NFS3ERR_IO,
        mountstat3::MNT3ERR_ACCES => nfsstat3::NFS3ERR_ACCES,
        mountstat3::MNT3ERR_NOTDIR => nfsstat3::NFS3ERR_NOTDIR,
        mountstat3::MNT3ERR_INVAL => nfsstat3::NFS3ERR_INVAL,
        mountstat3::MNT3ERR_NAMETOOLONG => nfsstat3::NFS3ERR_NAMETOOLONG,
        mountstat3::MNT3ERR_NOTSUPP => nfsstat3::NFS3ERR_NOTSUPP,
        mountstat3::MNT3ERR_SERVERFAULT => nfsstat3::NFS3ERR_SERVERFAULT,
    }
}
