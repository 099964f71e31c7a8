//! Test doubles: an in-memory NFS/MOUNT/PORTMAP server with an RPCSEC_GSS
//! acceptor, transports that talk to it, and a scripted pipe transport for
//! connection-level tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use num_traits::FromPrimitive;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use nfs_mamont_client::error::{Error, Result};
use nfs_mamont_client::protocol::rpc::{
    ConnectionRegistry, Credential, Endpoint, GssMechanism, RpcClient, SecurityContext, Transport,
    TransportKind,
};
use nfs_mamont_client::xdr::gss::{
    rpc_gss_cred_t, rpc_gss_init_res, rpc_gss_integ_data, rpc_gss_priv_data, rpc_gss_proc_t,
    rpc_gss_service_t, GSS_S_COMPLETE, GSS_S_CONTINUE_NEEDED, GSS_S_FAILURE, GSS_S_NO_CRED,
};
use nfs_mamont_client::xdr::mount::{self, mountres3_ok, mountstat3};
use nfs_mamont_client::xdr::nfs3::dir::{
    createhow3, dirlist3, entry3, CREATE3args, CREATE3resok, LOOKUP3resok, MKDIR3args,
    READDIR3args, READDIR3resok, READLINK3resok, RENAME3args, RENAME3resok,
};
use nfs_mamont_client::xdr::nfs3::file::{
    stable_how, ACCESS3args, ACCESS3resok, COMMIT3args, COMMIT3resok, GETATTR3resok, READ3args,
    READ3resok, WRITE3args, WRITE3resok,
};
use nfs_mamont_client::xdr::nfs3::fs::{fsinfo3, FSF_CANSETTIME, FSF_HOMOGENEOUS};
use nfs_mamont_client::xdr::nfs3::{
    self, diropargs3, fattr3, ftype3, nfs_fh3, nfsstat3, nfstime3, post_op_attr, post_op_fh3,
    wcc_data, writeverf3, NFSProgram,
};
use nfs_mamont_client::xdr::portmap::{self, mapping};
use nfs_mamont_client::xdr::rpc::{
    accept_body, accepted_reply_message, auth_error_reply_message, auth_flavor, auth_stat,
    opaque_auth, rpc_body, rpc_msg,
};
use nfs_mamont_client::xdr::{deserialize, Deserialize, Serialize};
use nfs_mamont_client::{ClientConfig, NfsClient};

pub const ROOT_ID: u64 = 1;
pub const MOUNT_PORT: u16 = 20048;
pub const GSS_WINDOW: u32 = 64;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small blocks and short timeouts so tests exercise many buffers quickly.
pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_timeout(Duration::from_millis(500))
        .with_retries(3)
        .with_block_size(1024)
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.serialize(&mut out).expect("encode reply");
    out
}

fn arg<T: Deserialize + Default>(src: &mut &[u8]) -> T {
    deserialize(src).expect("malformed arguments")
}

/// Deterministic stand-in for a GSS message integrity code.
pub fn mic(data: &[u8]) -> Vec<u8> {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash.to_be_bytes().to_vec()
}

/// Stand-in for GSS wrap and unwrap; applying it twice is the identity.
pub fn scramble(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ 0x5a).collect()
}

pub fn fh(fileid: u64) -> nfs_fh3 {
    nfs_fh3 { data: fileid.to_be_bytes().to_vec() }
}

fn fileid_of(fh: &nfs_fh3) -> Option<u64> {
    let bytes: [u8; 8] = fh.data.as_slice().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[derive(Clone, Debug)]
pub struct Node {
    pub fileid: u64,
    pub ftype: ftype3,
    pub mode: u32,
    /// Contents as clients see them, unstable writes included.
    pub data: Vec<u8>,
    /// Contents that survive a server restart.
    pub stable: Vec<u8>,
    pub children: BTreeMap<String, u64>,
    pub target: String,
    pub mtime: nfstime3,
}

impl Node {
    fn attributes(&self) -> fattr3 {
        let size = match self.ftype {
            ftype3::NF3LNK => self.target.len() as u64,
            _ => self.data.len() as u64,
        };
        fattr3 {
            ftype: self.ftype,
            mode: self.mode,
            nlink: if self.ftype == ftype3::NF3DIR { 2 } else { 1 },
            uid: 0,
            gid: 0,
            size,
            used: size,
            rdev: Default::default(),
            fsid: 1,
            fileid: self.fileid,
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Call {
    pub prog: u32,
    pub proc: u32,
    pub kind: TransportKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteCall {
    pub offset: u64,
    pub count: usize,
    pub stable: stable_how,
}

/// Server-side RPCSEC_GSS bookkeeping. The handshake takes three client
/// tokens; the reply verifier of DATA calls is the MIC of the sequence
/// number.
#[derive(Default)]
pub struct GssServer {
    contexts: HashSet<Vec<u8>>,
    rounds: HashMap<Vec<u8>, u32>,
    next_handle: u32,
    pub init_calls: usize,
    /// INIT calls to answer with `GSS_S_NO_CRED`.
    pub fail_inits: usize,
    /// DATA calls to deny with `RPCSEC_GSS_CTXPROBLEM`, dropping the context.
    pub reject_data: usize,
    pub destroyed: usize,
    pub seqs: Vec<u32>,
    /// DATA replies whose protected results carry the next sequence number.
    pub skew_seq: usize,
    /// DATA replies whose verifier is not a MIC of the sequence number.
    pub forge_verf: usize,
}

impl GssServer {
    fn init(&mut self, cred: &rpc_gss_cred_t, token: &[u8]) -> (rpc_gss_init_res, opaque_auth) {
        self.init_calls += 1;
        let failure = |major| rpc_gss_init_res { gss_major: major, ..Default::default() };
        if self.fail_inits > 0 {
            self.fail_inits -= 1;
            return (failure(GSS_S_NO_CRED), opaque_auth::null());
        }

        if cred.gss_proc == rpc_gss_proc_t::RPCSEC_GSS_INIT {
            if token != b"token-1" {
                return (failure(GSS_S_FAILURE), opaque_auth::null());
            }
            self.next_handle += 1;
            let handle = format!("ctx{}", self.next_handle).into_bytes();
            self.rounds.insert(handle.clone(), 1);
            let res = rpc_gss_init_res {
                handle,
                gss_major: GSS_S_CONTINUE_NEEDED,
                gss_minor: 0,
                seq_window: GSS_WINDOW,
                gss_token: b"reply-1".to_vec(),
            };
            return (res, opaque_auth::null());
        }

        let Some(round) = self.rounds.get_mut(&cred.handle) else {
            return (failure(GSS_S_FAILURE), opaque_auth::null());
        };
        *round += 1;
        if *round == 2 && token == b"token-2" {
            let res = rpc_gss_init_res {
                handle: cred.handle.clone(),
                gss_major: GSS_S_CONTINUE_NEEDED,
                gss_minor: 0,
                seq_window: GSS_WINDOW,
                gss_token: b"reply-2".to_vec(),
            };
            (res, opaque_auth::null())
        } else if *round == 3 && token == b"token-3" {
            self.rounds.remove(&cred.handle);
            self.contexts.insert(cred.handle.clone());
            let res = rpc_gss_init_res {
                handle: cred.handle.clone(),
                gss_major: GSS_S_COMPLETE,
                gss_minor: 0,
                seq_window: GSS_WINDOW,
                gss_token: Vec::new(),
            };
            let verf = opaque_auth {
                flavor: auth_flavor::RPCSEC_GSS,
                body: mic(&GSS_WINDOW.to_be_bytes()),
            };
            (res, verf)
        } else {
            (failure(GSS_S_FAILURE), opaque_auth::null())
        }
    }

    fn check(
        &mut self,
        cred: &rpc_gss_cred_t,
        header: &[u8],
        verf: &opaque_auth,
    ) -> std::result::Result<(), auth_stat> {
        if !self.contexts.contains(&cred.handle) {
            return Err(auth_stat::RPCSEC_GSS_CTXPROBLEM);
        }
        if cred.gss_proc == rpc_gss_proc_t::RPCSEC_GSS_DATA && self.reject_data > 0 {
            self.reject_data -= 1;
            self.contexts.remove(&cred.handle);
            return Err(auth_stat::RPCSEC_GSS_CTXPROBLEM);
        }
        if verf.flavor != auth_flavor::RPCSEC_GSS || verf.body != mic(header) {
            return Err(auth_stat::RPCSEC_GSS_CREDPROBLEM);
        }
        Ok(())
    }

    pub fn is_active(&self, handle: &[u8]) -> bool {
        self.contexts.contains(handle)
    }
}

pub struct ServerState {
    nodes: HashMap<u64, Node>,
    next_fileid: u64,
    /// Resolves paths relative to the WebNFS public handle.
    pub public: bool,
    /// Paths MNT accepts.
    pub exports: Vec<String>,
    pub max_read: usize,
    pub max_write: usize,
    pub wtpref: u32,
    pub verifier: writeverf3,
    /// Simulates a restart, losing uncommitted data, after this many WRITEs.
    pub restart_after_writes: Option<usize>,
    pub readdir_page: usize,
    /// ACCESS bits granted to everyone.
    pub granted: u32,
    /// Calls to swallow without a reply.
    pub drop_calls: usize,
    pub dropped: usize,
    /// Deny AUTH_NULL calls to the NFS program.
    pub deny_null_auth: bool,
    /// TCP connections are refused.
    pub tcp_down: bool,
    /// Sends never complete, like a connect to a host that drops packets.
    pub stall_sends: bool,
    /// WRITEs to fail with `NFS3ERR_NOSPC`.
    pub fail_writes: usize,
    pub calls: Vec<Call>,
    pub reads: Vec<(u64, u32)>,
    pub writes: Vec<WriteCall>,
    pub commits: Vec<(u64, u32)>,
    pub mounts: Vec<String>,
    pub gss: GssServer,
}

impl ServerState {
    fn node(&self, fh: &nfs_fh3) -> std::result::Result<&Node, nfsstat3> {
        if fh.data.is_empty() {
            return match self.public {
                true => self.nodes.get(&ROOT_ID).ok_or(nfsstat3::NFS3ERR_STALE),
                false => Err(nfsstat3::NFS3ERR_STALE),
            };
        }
        let id = fileid_of(fh).ok_or(nfsstat3::NFS3ERR_BADHANDLE)?;
        self.nodes.get(&id).ok_or(nfsstat3::NFS3ERR_STALE)
    }

    fn node_mut(&mut self, fh: &nfs_fh3) -> std::result::Result<&mut Node, nfsstat3> {
        let id = self.node(fh)?.fileid;
        self.nodes.get_mut(&id).ok_or(nfsstat3::NFS3ERR_STALE)
    }

    fn attributes(&self, id: u64) -> post_op_attr {
        match self.nodes.get(&id) {
            Some(node) => post_op_attr::attributes(node.attributes()),
            None => post_op_attr::Void,
        }
    }

    fn walk(&self, from: u64, path: &str) -> Option<u64> {
        let mut id = from;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            id = *self.nodes.get(&id)?.children.get(name)?;
        }
        Some(id)
    }

    fn touch(&mut self, id: u64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.mtime.seconds += 1;
        }
    }

    fn add_node(&mut self, parent: u64, name: &str, ftype: ftype3, mode: u32) -> u64 {
        let fileid = self.next_fileid;
        self.next_fileid += 1;
        let node = Node {
            fileid,
            ftype,
            mode,
            data: Vec::new(),
            stable: Vec::new(),
            children: BTreeMap::new(),
            target: String::new(),
            mtime: nfstime3 { seconds: 1_600_000_000, nseconds: 0 },
        };
        self.nodes.insert(fileid, node);
        if let Some(dir) = self.nodes.get_mut(&parent) {
            dir.children.insert(name.to_string(), fileid);
        }
        self.touch(parent);
        fileid
    }

    /// Creates the missing directories of `path` and returns the parent id
    /// and the last component.
    fn make_parents<'a>(&mut self, path: &'a str) -> (u64, &'a str) {
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let name = components.pop().expect("path has a name");
        let mut id = ROOT_ID;
        for dir in components {
            let existing = self.nodes[&id].children.get(dir).copied();
            id = match existing {
                Some(child) => child,
                None => self.add_node(id, dir, ftype3::NF3DIR, 0o755),
            };
        }
        (id, name)
    }

    fn restart(&mut self) {
        self.verifier[0] = self.verifier[0].wrapping_add(1);
        for node in self.nodes.values_mut() {
            node.data = node.stable.clone();
        }
    }

    fn nfs(&mut self, proc: u32, src: &mut &[u8]) -> std::result::Result<Vec<u8>, accept_body> {
        let Some(proc) = NFSProgram::from_u32(proc) else {
            return Err(accept_body::PROC_UNAVAIL);
        };
        let res = match proc {
            NFSProgram::NFSPROC3_NULL => return Ok(Vec::new()),
            NFSProgram::NFSPROC3_GETATTR => self.getattr(arg(src)),
            NFSProgram::NFSPROC3_LOOKUP => self.lookup(arg(src)),
            NFSProgram::NFSPROC3_ACCESS => self.access(arg(src)),
            NFSProgram::NFSPROC3_READLINK => self.readlink(arg(src)),
            NFSProgram::NFSPROC3_READ => self.read(arg(src)),
            NFSProgram::NFSPROC3_WRITE => self.write(arg(src)),
            NFSProgram::NFSPROC3_CREATE => self.create(arg(src)),
            NFSProgram::NFSPROC3_MKDIR => self.mkdir(arg(src)),
            NFSProgram::NFSPROC3_REMOVE => self.remove(arg(src), false),
            NFSProgram::NFSPROC3_RMDIR => self.remove(arg(src), true),
            NFSProgram::NFSPROC3_RENAME => self.rename(arg(src)),
            NFSProgram::NFSPROC3_READDIR => self.readdir(arg(src)),
            NFSProgram::NFSPROC3_FSINFO => self.fsinfo(arg(src)),
            NFSProgram::NFSPROC3_COMMIT => self.commit(arg(src)),
            _ => return Err(accept_body::PROC_UNAVAIL),
        };
        Ok(res.unwrap_or_else(|stat| encode(&stat)))
    }

    fn getattr(&self, fh: nfs_fh3) -> std::result::Result<Vec<u8>, nfsstat3> {
        let node = self.node(&fh)?;
        Ok(ok(&GETATTR3resok { obj_attributes: node.attributes() }))
    }

    fn lookup(&self, args: diropargs3) -> std::result::Result<Vec<u8>, nfsstat3> {
        let dir = self.node(&args.dir)?;
        if dir.ftype != ftype3::NF3DIR {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        let name = args.name.to_string_lossy();
        // Only the public handle takes multi-component names.
        if !args.dir.data.is_empty() && name.contains('/') {
            return Err(nfsstat3::NFS3ERR_NOENT);
        }
        let id = self.walk(dir.fileid, &name).ok_or(nfsstat3::NFS3ERR_NOENT)?;
        Ok(ok(&LOOKUP3resok {
            object: fh(id),
            obj_attributes: self.attributes(id),
            dir_attributes: self.attributes(dir.fileid),
        }))
    }

    fn access(&self, args: ACCESS3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        let node = self.node(&args.object)?;
        Ok(ok(&ACCESS3resok {
            obj_attributes: post_op_attr::attributes(node.attributes()),
            access: args.access & self.granted,
        }))
    }

    fn readlink(&self, fh: nfs_fh3) -> std::result::Result<Vec<u8>, nfsstat3> {
        let node = self.node(&fh)?;
        if node.ftype != ftype3::NF3LNK {
            return Err(nfsstat3::NFS3ERR_INVAL);
        }
        Ok(ok(&READLINK3resok {
            symlink_attributes: post_op_attr::attributes(node.attributes()),
            data: node.target.as_str().into(),
        }))
    }

    fn read(&mut self, args: READ3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        self.reads.push((args.offset, args.count));
        let max_read = self.max_read;
        let node = self.node(&args.file)?;
        if node.ftype == ftype3::NF3DIR {
            return Err(nfsstat3::NFS3ERR_ISDIR);
        }
        let len = node.data.len();
        let start = (args.offset as usize).min(len);
        let end = (start + (args.count as usize).min(max_read)).min(len);
        let data = node.data[start..end].to_vec();
        Ok(ok(&READ3resok {
            file_attributes: post_op_attr::attributes(node.attributes()),
            count: data.len() as u32,
            eof: end >= len,
            data,
        }))
    }

    fn write(&mut self, args: WRITE3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        let count = args.data.len().min(args.count as usize).min(self.max_write);
        self.writes.push(WriteCall { offset: args.offset, count, stable: args.stable });
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(nfsstat3::NFS3ERR_NOSPC);
        }
        let verf = self.verifier;
        let node = self.node_mut(&args.file)?;
        if node.ftype != ftype3::NF3REG {
            return Err(nfsstat3::NFS3ERR_INVAL);
        }
        let start = args.offset as usize;
        splice(&mut node.data, start, &args.data[..count]);
        if args.stable != stable_how::UNSTABLE {
            splice(&mut node.stable, start, &args.data[..count]);
        }
        node.mtime.seconds += 1;
        let after = post_op_attr::attributes(node.attributes());

        let committed = match args.stable {
            stable_how::UNSTABLE => stable_how::UNSTABLE,
            _ => stable_how::FILE_SYNC,
        };
        let res = ok(&WRITE3resok {
            file_wcc: wcc_data { before: Default::default(), after },
            count: count as u32,
            committed,
            verf,
        });
        if self.restart_after_writes == Some(self.writes.len()) {
            self.restart();
        }
        Ok(res)
    }

    fn commit(&mut self, args: COMMIT3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        self.commits.push((args.offset, args.count));
        let verf = self.verifier;
        let node = self.node_mut(&args.file)?;
        node.stable = node.data.clone();
        Ok(ok(&COMMIT3resok {
            file_wcc: wcc_data {
                before: Default::default(),
                after: post_op_attr::attributes(node.attributes()),
            },
            verf,
        }))
    }

    fn created(&self, dir: u64, id: u64) -> Vec<u8> {
        ok(&CREATE3resok {
            obj: post_op_fh3::handle(fh(id)),
            obj_attributes: self.attributes(id),
            dir_wcc: wcc_data { before: Default::default(), after: self.attributes(dir) },
        })
    }

    fn create(&mut self, args: CREATE3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        let dir = self.node(&args.location.dir)?.fileid;
        let name = args.location.name.to_string_lossy();
        let existing = self.nodes[&dir].children.get(&name).copied();
        let id = match (existing, &args.how) {
            (Some(id), createhow3::UNCHECKED(_)) => id,
            (Some(_), _) => return Err(nfsstat3::NFS3ERR_EXIST),
            (None, _) => self.add_node(dir, &name, ftype3::NF3REG, 0o644),
        };
        Ok(self.created(dir, id))
    }

    fn mkdir(&mut self, args: MKDIR3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        let dir = self.node(&args.location.dir)?.fileid;
        let name = args.location.name.to_string_lossy();
        if self.nodes[&dir].children.contains_key(&name) {
            return Err(nfsstat3::NFS3ERR_EXIST);
        }
        let id = self.add_node(dir, &name, ftype3::NF3DIR, 0o755);
        Ok(self.created(dir, id))
    }

    fn remove(&mut self, args: diropargs3, rmdir: bool) -> std::result::Result<Vec<u8>, nfsstat3> {
        let dir = self.node(&args.dir)?.fileid;
        let name = args.name.to_string_lossy();
        let id = *self.nodes[&dir].children.get(&name).ok_or(nfsstat3::NFS3ERR_NOENT)?;
        let node = &self.nodes[&id];
        match (rmdir, node.ftype == ftype3::NF3DIR) {
            (true, false) => return Err(nfsstat3::NFS3ERR_NOTDIR),
            (false, true) => return Err(nfsstat3::NFS3ERR_ISDIR),
            (true, true) if !node.children.is_empty() => return Err(nfsstat3::NFS3ERR_NOTEMPTY),
            _ => {}
        }
        self.nodes.remove(&id);
        if let Some(parent) = self.nodes.get_mut(&dir) {
            parent.children.remove(&name);
        }
        self.touch(dir);
        Ok(ok(&wcc_data { before: Default::default(), after: self.attributes(dir) }))
    }

    fn rename(&mut self, args: RENAME3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        let from = self.node(&args.from.dir)?.fileid;
        let to = self.node(&args.to.dir)?.fileid;
        let from_name = args.from.name.to_string_lossy();
        let to_name = args.to.name.to_string_lossy();
        let id = self
            .nodes
            .get_mut(&from)
            .and_then(|dir| dir.children.remove(&from_name))
            .ok_or(nfsstat3::NFS3ERR_NOENT)?;
        let replaced = self.nodes.get_mut(&to).and_then(|dir| dir.children.insert(to_name, id));
        if let Some(replaced) = replaced {
            self.nodes.remove(&replaced);
        }
        self.touch(from);
        self.touch(to);
        Ok(ok(&RENAME3resok {
            fromdir_wcc: wcc_data { before: Default::default(), after: self.attributes(from) },
            todir_wcc: wcc_data { before: Default::default(), after: self.attributes(to) },
        }))
    }

    fn readdir(&self, args: READDIR3args) -> std::result::Result<Vec<u8>, nfsstat3> {
        let dir = self.node(&args.dir)?;
        if dir.ftype != ftype3::NF3DIR {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        let mut all = vec![(".".to_string(), dir.fileid), ("..".to_string(), ROOT_ID)];
        all.extend(dir.children.iter().map(|(name, id)| (name.clone(), *id)));

        let start = args.cookie as usize;
        let end = (start + self.readdir_page.max(1)).min(all.len());
        let entries = all[start.min(end)..end]
            .iter()
            .enumerate()
            .map(|(i, (name, id))| entry3 {
                fileid: *id,
                name: name.as_str().into(),
                cookie: (start + i + 1) as u64,
            })
            .collect();
        Ok(ok(&READDIR3resok {
            dir_attributes: post_op_attr::attributes(dir.attributes()),
            cookieverf: [7; 8],
            reply: dirlist3 { entries, eof: end >= all.len() },
        }))
    }

    fn fsinfo(&self, fh: nfs_fh3) -> std::result::Result<Vec<u8>, nfsstat3> {
        let node = self.node(&fh)?;
        Ok(ok(&fsinfo3 {
            obj_attributes: post_op_attr::attributes(node.attributes()),
            rtmax: self.max_read as u32,
            rtpref: self.max_read as u32,
            rtmult: 512,
            wtmax: self.max_write.min(u32::MAX as usize) as u32,
            wtpref: self.wtpref,
            wtmult: 512,
            dtpref: 4096,
            maxfilesize: u64::MAX,
            time_delta: nfstime3 { seconds: 0, nseconds: 1 },
            properties: FSF_HOMOGENEOUS | FSF_CANSETTIME,
        }))
    }

    fn mount(&mut self, proc: u32, src: &mut &[u8]) -> std::result::Result<Vec<u8>, accept_body> {
        match proc {
            0 => Ok(Vec::new()),
            1 => {
                let path = String::from_utf8_lossy(&arg::<Vec<u8>>(src)).into_owned();
                self.mounts.push(path.clone());
                let root =
                    self.exports.contains(&path).then(|| self.walk(ROOT_ID, &path)).flatten();
                let mut out = Vec::new();
                match root {
                    Some(id) => {
                        mountstat3::MNT3_OK.serialize(&mut out).expect("encode");
                        let res = mountres3_ok { fhandle: fh(id).data, auth_flavors: vec![1] };
                        res.serialize(&mut out).expect("encode");
                    }
                    None => mountstat3::MNT3ERR_NOENT.serialize(&mut out).expect("encode"),
                }
                Ok(out)
            }
            _ => Err(accept_body::PROC_UNAVAIL),
        }
    }

    fn portmap(&mut self, proc: u32, src: &mut &[u8]) -> std::result::Result<Vec<u8>, accept_body> {
        match proc {
            0 => Ok(Vec::new()),
            3 => {
                let query: mapping = arg(src);
                let port: u32 = match query.prog {
                    mount::PROGRAM => MOUNT_PORT as u32,
                    nfs3::PROGRAM => nfs3::NFS_PORT as u32,
                    _ => 0,
                };
                Ok(encode(&port))
            }
            _ => Err(accept_body::PROC_UNAVAIL),
        }
    }
}

fn splice(target: &mut Vec<u8>, start: usize, data: &[u8]) {
    let end = start + data.len();
    if target.len() < end {
        target.resize(end, 0);
    }
    target[start..end].copy_from_slice(data);
}

fn ok<T: Serialize + ?Sized>(body: &T) -> Vec<u8> {
    let mut out = encode(&nfsstat3::NFS3_OK);
    body.serialize(&mut out).expect("encode reply");
    out
}

/// The in-memory server. Starts with an empty root directory exported as
/// `/` and reachable through the public handle.
pub struct MockServer {
    state: Mutex<ServerState>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                fileid: ROOT_ID,
                ftype: ftype3::NF3DIR,
                mode: 0o755,
                data: Vec::new(),
                stable: Vec::new(),
                children: BTreeMap::new(),
                target: String::new(),
                mtime: nfstime3 { seconds: 1_600_000_000, nseconds: 0 },
            },
        );
        Arc::new(Self {
            state: Mutex::new(ServerState {
                nodes,
                next_fileid: ROOT_ID + 1,
                public: true,
                exports: vec![String::from("/")],
                max_read: 1 << 20,
                max_write: 1 << 20,
                wtpref: 1024,
                verifier: [1, 0, 0, 0, 0, 0, 0, 0],
                restart_after_writes: None,
                readdir_page: 3,
                granted: u32::MAX,
                drop_calls: 0,
                dropped: 0,
                deny_null_auth: false,
                tcp_down: false,
                stall_sends: false,
                fail_writes: 0,
                calls: Vec::new(),
                reads: Vec::new(),
                writes: Vec::new(),
                commits: Vec::new(),
                mounts: Vec::new(),
                gss: GssServer::default(),
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_file(&self, path: &str, data: &[u8]) -> u64 {
        let mut state = self.state();
        let (parent, name) = state.make_parents(path);
        let id = state.add_node(parent, name, ftype3::NF3REG, 0o644);
        let node = state.nodes.get_mut(&id).expect("node just added");
        node.data = data.to_vec();
        node.stable = data.to_vec();
        id
    }

    pub fn add_dir(&self, path: &str) -> u64 {
        let mut state = self.state();
        let (parent, name) = state.make_parents(path);
        state.add_node(parent, name, ftype3::NF3DIR, 0o755)
    }

    pub fn add_symlink(&self, path: &str, target: &str) -> u64 {
        let mut state = self.state();
        let (parent, name) = state.make_parents(path);
        let id = state.add_node(parent, name, ftype3::NF3LNK, 0o777);
        state.nodes.get_mut(&id).expect("node just added").target = target.to_string();
        id
    }

    /// Replaces the contents of the file at `path`, as a write from another
    /// client would.
    pub fn set_file_data(&self, path: &str, data: &[u8]) {
        let mut state = self.state();
        let id = state.walk(ROOT_ID, path).expect("file exists");
        state.touch(id);
        let node = state.nodes.get_mut(&id).expect("file exists");
        node.data = data.to_vec();
        node.stable = data.to_vec();
    }

    /// Contents of the file at `path` as clients would read them.
    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state();
        let id = state.walk(ROOT_ID, path)?;
        Some(state.nodes.get(&id)?.data.clone())
    }

    /// Contents of the file at `path` that would survive a restart.
    pub fn stable_data(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state();
        let id = state.walk(ROOT_ID, path)?;
        Some(state.nodes.get(&id)?.stable.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().walk(ROOT_ID, path).is_some()
    }

    /// Number of calls received for `proc` of `prog`.
    pub fn count(&self, prog: u32, proc: u32) -> usize {
        self.state().calls.iter().filter(|c| c.prog == prog && c.proc == proc).count()
    }

    pub fn nfs_count(&self, proc: NFSProgram) -> usize {
        self.count(nfs3::PROGRAM, proc as u32)
    }

    /// Answers one RPC call. `None` means the call is swallowed.
    pub fn handle(&self, kind: TransportKind, message: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state();
        let mut src = message;
        let msg: rpc_msg = deserialize(&mut src).expect("malformed call");
        let xid = msg.xid;
        let rpc_body::CALL(call) = msg.body else { panic!("server received a reply") };
        state.calls.push(Call { prog: call.prog, proc: call.proc, kind });
        if state.drop_calls > 0 {
            state.drop_calls -= 1;
            state.dropped += 1;
            return None;
        }

        // xid, message type, RPC version, program, version, procedure and
        // the credential: what the GSS call verifier covers.
        let header_end = 24 + 8 + call.cred.body.len().div_ceil(4) * 4;
        let mut verf = opaque_auth::null();
        let mut protection = None;
        let args: Vec<u8> = match call.cred.flavor {
            auth_flavor::RPCSEC_GSS => {
                let cred: rpc_gss_cred_t = arg(&mut call.cred.body.as_slice());
                match cred.gss_proc {
                    rpc_gss_proc_t::RPCSEC_GSS_INIT | rpc_gss_proc_t::RPCSEC_GSS_CONTINUE_INIT => {
                        let token: Vec<u8> = arg(&mut src);
                        let (res, verf) = state.gss.init(&cred, &token);
                        let reply = accepted_reply_message(xid, verf, accept_body::SUCCESS);
                        let mut out = encode(&reply);
                        res.serialize(&mut out).expect("encode");
                        return Some(out);
                    }
                    rpc_gss_proc_t::RPCSEC_GSS_DATA | rpc_gss_proc_t::RPCSEC_GSS_DESTROY => {
                        let checked = state.gss.check(&cred, &message[..header_end], &call.verf);
                        if let Err(stat) = checked {
                            return Some(encode(&auth_error_reply_message(xid, stat)));
                        }
                        verf = opaque_auth {
                            flavor: auth_flavor::RPCSEC_GSS,
                            body: mic(&cred.seq_num.to_be_bytes()),
                        };
                        if cred.gss_proc == rpc_gss_proc_t::RPCSEC_GSS_DESTROY {
                            state.gss.contexts.remove(&cred.handle);
                            state.gss.destroyed += 1;
                            let reply = accepted_reply_message(xid, verf, accept_body::SUCCESS);
                            return Some(encode(&reply));
                        }
                        if state.gss.forge_verf > 0 {
                            state.gss.forge_verf -= 1;
                            verf.body = mic(&cred.seq_num.wrapping_add(1).to_be_bytes());
                        }
                        state.gss.seqs.push(cred.seq_num);
                        let mut reply_seq = cred.seq_num;
                        if state.gss.skew_seq > 0 {
                            state.gss.skew_seq -= 1;
                            reply_seq = reply_seq.wrapping_add(1);
                        }
                        protection = Some((cred.service, reply_seq));
                        match cred.service {
                            rpc_gss_service_t::rpc_gss_svc_none => src.to_vec(),
                            rpc_gss_service_t::rpc_gss_svc_integrity => {
                                let data: rpc_gss_integ_data = arg(&mut src);
                                let checksum = mic(&data.databody_integ);
                                assert_eq!(checksum, data.checksum, "bad argument checksum");
                                data.databody_integ[4..].to_vec()
                            }
                            rpc_gss_service_t::rpc_gss_svc_privacy => {
                                let data: rpc_gss_priv_data = arg(&mut src);
                                scramble(&data.databody_priv)[4..].to_vec()
                            }
                        }
                    }
                }
            }
            auth_flavor::AUTH_NULL if state.deny_null_auth && call.prog == nfs3::PROGRAM => {
                return Some(encode(&auth_error_reply_message(xid, auth_stat::AUTH_TOOWEAK)));
            }
            _ => src.to_vec(),
        };

        let mut args = args.as_slice();
        let results = match (call.prog, call.vers) {
            (nfs3::PROGRAM, nfs3::VERSION) => state.nfs(call.proc, &mut args),
            (mount::PROGRAM, mount::VERSION) => state.mount(call.proc, &mut args),
            (portmap::PROGRAM, portmap::VERSION) => state.portmap(call.proc, &mut args),
            _ => Err(accept_body::PROG_UNAVAIL),
        };
        let results = match results {
            Ok(results) => results,
            Err(stat) => return Some(encode(&accepted_reply_message(xid, verf, stat))),
        };

        let body = match protection {
            Some((rpc_gss_service_t::rpc_gss_svc_integrity, seq)) => {
                let mut databody = seq.to_be_bytes().to_vec();
                databody.extend_from_slice(&results);
                encode(&rpc_gss_integ_data { checksum: mic(&databody), databody_integ: databody })
            }
            Some((rpc_gss_service_t::rpc_gss_svc_privacy, seq)) => {
                let mut databody = seq.to_be_bytes().to_vec();
                databody.extend_from_slice(&results);
                encode(&rpc_gss_priv_data { databody_priv: scramble(&databody) })
            }
            _ => results,
        };
        let mut out = encode(&accepted_reply_message(xid, verf, accept_body::SUCCESS));
        out.extend_from_slice(&body);
        Some(out)
    }
}

/// A transport whose peer is a [`MockServer`]. Replies are queued as the
/// calls are sent.
pub struct MockTransport {
    endpoint: Endpoint,
    server: Arc<MockServer>,
    connected: AtomicBool,
    replies: mpsc::UnboundedSender<Vec<u8>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MockTransport {
    pub fn new(endpoint: Endpoint, server: Arc<MockServer>) -> Self {
        let (replies, incoming) = mpsc::unbounded_channel();
        Self {
            endpoint,
            server,
            connected: AtomicBool::new(false),
            replies,
            incoming: AsyncMutex::new(incoming),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &[u8]) -> Result<()> {
        let stalled = self.server.state().stall_sends;
        if stalled {
            std::future::pending::<()>().await;
        }
        if self.endpoint.kind == TransportKind::Tcp && self.server.state().tcp_down {
            return Err(Error::ConnectionFailed {
                server: self.endpoint.to_string(),
                reason: String::from("connection refused"),
            });
        }
        self.connected.store(true, Ordering::Release);
        if let Some(reply) = self.server.handle(self.endpoint.kind, message) {
            let _ = self.replies.send(reply);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        }
        self.incoming.lock().await.recv().await.ok_or_else(|| Error::ConnectionFailed {
            server: self.endpoint.to_string(),
            reason: String::from("server gone"),
        })
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// A registry whose connections all lead to `server`.
pub fn registry(server: &Arc<MockServer>) -> ConnectionRegistry {
    let server = server.clone();
    let factory = move |endpoint: &Endpoint| -> Arc<dyn Transport> {
        Arc::new(MockTransport::new(endpoint.clone(), server.clone()))
    };
    ConnectionRegistry::with_factory(Duration::from_secs(30), factory)
}

pub fn client(server: &Arc<MockServer>, config: ClientConfig) -> NfsClient {
    NfsClient::builder(config).registry(registry(server)).build()
}

pub fn client_with(
    server: &Arc<MockServer>,
    config: ClientConfig,
    credential: Credential,
) -> NfsClient {
    NfsClient::builder(config).registry(registry(server)).credential(credential).build()
}

/// An RPC client for `prog` version `vers` on the mock server.
pub fn rpc_client(
    server: &Arc<MockServer>,
    prog: u32,
    vers: u32,
    credential: Credential,
    config: &ClientConfig,
) -> RpcClient {
    let endpoint = Endpoint::new("server", nfs3::NFS_PORT, TransportKind::Tcp);
    let connection = registry(server).get(&endpoint);
    RpcClient::new(connection, prog, vers, credential, config)
}

/// Client side of the three-token handshake the mock server expects.
pub struct MockMechanism {
    pub contexts: Arc<AtomicUsize>,
}

impl MockMechanism {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let contexts = Arc::new(AtomicUsize::new(0));
        (Self { contexts: contexts.clone() }, contexts)
    }
}

impl GssMechanism for MockMechanism {
    fn new_context(&self, _service: &str) -> Result<Box<dyn SecurityContext>> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext { step: 0 }))
    }
}

struct MockContext {
    step: u32,
}

impl SecurityContext for MockContext {
    fn init_sec_context(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        let expected: &[u8] = match self.step {
            0 => b"",
            1 => b"reply-1",
            2 => b"reply-2",
            _ => return Ok(None),
        };
        if input != expected {
            return Err(Error::Gss { major: GSS_S_FAILURE, minor: self.step });
        }
        self.step += 1;
        Ok(Some(format!("token-{}", self.step).into_bytes()))
    }

    fn is_established(&self) -> bool {
        self.step >= 3
    }

    fn get_mic(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(mic(message))
    }

    fn verify_mic(&self, message: &[u8], checksum: &[u8]) -> Result<()> {
        if mic(message) == checksum {
            Ok(())
        } else {
            Err(Error::Gss { major: 6 << 16, minor: 0 })
        }
    }

    fn wrap(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(scramble(message))
    }

    fn unwrap(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(scramble(message))
    }
}

/// Transport driven by the test through a [`PipePeer`].
pub struct PipeTransport {
    endpoint: Endpoint,
    connected: AtomicBool,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Result<Vec<u8>>>>,
    pub disconnects: AtomicUsize,
}

pub struct PipePeer {
    /// Messages the connection sent.
    pub sent: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Messages, or receive errors, for the connection.
    pub replies: mpsc::UnboundedSender<Result<Vec<u8>>>,
}

impl PipePeer {
    pub async fn next_xid(&mut self) -> u32 {
        let message = self.sent.recv().await.expect("connection sent a message");
        u32::from_be_bytes([message[0], message[1], message[2], message[3]])
    }

    pub fn reply(&self, xid: u32, payload: &[u8]) {
        let mut message = xid.to_be_bytes().to_vec();
        message.extend_from_slice(payload);
        self.replies.send(Ok(message)).expect("connection listening");
    }
}

pub fn pipe() -> (Arc<PipeTransport>, PipePeer) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(PipeTransport {
        endpoint: Endpoint::new("pipe", 2049, TransportKind::Tcp),
        connected: AtomicBool::new(false),
        sent: sent_tx,
        incoming: AsyncMutex::new(reply_rx),
        disconnects: AtomicUsize::new(0),
    });
    (transport, PipePeer { sent: sent_rx, replies: reply_tx })
}

/// A message that starts with `xid`.
pub fn message(xid: u32, payload: &[u8]) -> Vec<u8> {
    let mut message = xid.to_be_bytes().to_vec();
    message.extend_from_slice(payload);
    message
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, message: &[u8]) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        let _ = self.sent.send(message.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        }
        match self.incoming.lock().await.recv().await {
            Some(message) => message,
            None => Err(Error::ConnectionFailed {
                server: self.endpoint.to_string(),
                reason: String::from("peer closed"),
            }),
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
