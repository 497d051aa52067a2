#![doc = include_str!("../README.md")]

mod config;
mod dns;
mod droppable_handle;
mod entrypoint;
mod error;
mod host;
mod http;
mod lookup;
mod peek;
mod router;
mod ssh;
mod telemetry;
mod tls;

pub use crate::{
    config::ApplicationConfig,
    entrypoint::entrypoint,
    host::{
        AliasIdentity, EncodeOpts, HostDecodeError, HostIdentity, SshTarget, decode_alias_host,
        decode_host, decode_ssh_username, encode_host,
    },
    lookup::{InstanceLookup, LookupError, MemoryLookup, SshEndpoint},
};
