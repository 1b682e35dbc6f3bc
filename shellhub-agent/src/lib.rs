#[macro_use]
extern crate tracing;

pub mod client;
pub mod config;
pub mod connector;
pub mod info;
pub mod keys;
pub mod sftp;
pub mod sshd;
