//! NFS version 3 file access with a client-side block cache.

mod buffer;
mod client;
mod command_queue;
mod fattr;
mod file;
pub mod proto;

pub use buffer::BufferState;
pub use client::{NfsClient, NfsClientBuilder};
pub use fattr::{Fattr, FileType, ACMAX, ACMIN};
pub use file::NfsFile;
pub use proto::Nfs3;
