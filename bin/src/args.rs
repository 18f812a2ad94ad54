//! Arguments shared by several subcommands.

use clap::Args;
use color_eyre::eyre::{eyre, Context, Result};
use derive_more::Debug;
use ocimod_lib::{
    registry::{Authentication, Remote},
    Digest, Reference,
};
use std::str::FromStr;

/// How to reach the registry.
#[derive(Debug, Args)]
pub struct Connection {
    /// The username to use for authentication; "password" is also required if provided.
    #[arg(long, env = "OCIMOD_USERNAME", requires = "password")]
    username: Option<String>,

    /// The password to use for authentication; "username" is also required if provided.
    #[arg(long, env = "OCIMOD_PASSWORD", requires = "username")]
    #[debug(skip)]
    password: Option<String>,

    /// Connect over plain HTTP instead of HTTPS
    #[arg(long)]
    insecure: bool,
}

impl Connection {
    /// Build a client for the registry described by the arguments.
    pub fn registry(&self) -> Remote {
        let auth = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Authentication::basic(username, password),
            _ => Authentication::None,
        };
        Remote::builder().auth(auth).insecure(self.insecure).build()
    }
}

/// Parse a `name=value` pair. The value may be empty.
pub fn pair(input: &str) -> Result<(String, String)> {
    let (name, value) = input
        .split_once('=')
        .ok_or_else(|| eyre!("expected name=value, got {input:?}"))?;
    if name.is_empty() {
        return Err(eyre!("name cannot be empty in {input:?}"));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Parse a base image given as `name@digest`, keeping the tag of the name.
pub fn base(input: &str) -> Result<(Reference, Digest)> {
    let (name, digest) = input
        .rsplit_once('@')
        .ok_or_else(|| eyre!("expected name@digest, got {input:?}"))?;
    let name = Reference::from_str(name).context("parse base name")?;
    let digest = Digest::from_str(digest).context("parse base digest")?;
    Ok((name, digest))
}

/// Parse a pair of references given as `old,new`.
pub fn reference_pair(input: &str) -> Result<(Reference, Reference)> {
    let (old, new) = input
        .split_once(',')
        .ok_or_else(|| eyre!("expected old,new, got {input:?}"))?;
    let old = Reference::from_str(old).context("parse old base")?;
    let new = Reference::from_str(new).context("parse new base")?;
    Ok((old, new))
}
