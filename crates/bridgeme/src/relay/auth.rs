//! Relay authentication chain.
//!
//! Credentials are tried in a fixed order until the server accepts one:
//!
//! 1. the explicitly configured key file
//! 2. keys held by the SSH agent
//! 3. the default key files under `~/.ssh`
//!
//! Running out of credentials is an authentication failure. A transport
//! failure while authenticating aborts the chain as a connection failure.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::{BridgeError, Result};
use russh::client::{self, Handle};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};

/// Default key file names, tried in order.
pub const DEFAULT_KEY_FILES: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519", "id_dsa"];

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Signs agent-held keys without borrowing the key across an await.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = std::result::Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Existing default key files under `ssh_dir`, in preference order.
pub fn default_key_paths(ssh_dir: &Path) -> Vec<PathBuf> {
    DEFAULT_KEY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.is_file())
        .collect()
}

/// Authenticates `handle` as `username`.
pub async fn authenticate<H>(
    handle: &mut Handle<H>,
    username: &str,
    key_file: Option<&Path>,
) -> Result<()>
where
    H: client::Handler,
{
    let mut tried = Vec::new();

    if let Some(path) = key_file {
        tried.push(format!("key file {}", path.display()));
        if try_key_file(handle, username, path).await? {
            return Ok(());
        }
    }

    tried.push("ssh agent".to_string());
    if try_agent(handle, username).await? {
        return Ok(());
    }

    if let Some(home) = dirs::home_dir() {
        for path in default_key_paths(&home.join(".ssh")) {
            if key_file == Some(path.as_path()) {
                continue;
            }
            tried.push(format!("key file {}", path.display()));
            if try_key_file(handle, username, &path).await? {
                return Ok(());
            }
        }
    }

    Err(BridgeError::Authentication(format!(
        "no credential accepted for {} (tried {})",
        username,
        tried.join(", ")
    )))
}

async fn try_key_file<H>(handle: &mut Handle<H>, username: &str, path: &Path) -> Result<bool>
where
    H: client::Handler,
{
    let key = match russh::keys::load_secret_key(path, None) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Skipping unusable key file");
            return Ok(false);
        }
    };

    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
    let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

    let result = handle
        .authenticate_publickey(username, key)
        .await
        .map_err(|e| BridgeError::connection_with("relay connection lost during authentication", e))?;

    if result.success() {
        tracing::info!(path = %path.display(), "Authenticated with key file");
        Ok(true)
    } else {
        tracing::debug!(path = %path.display(), "Key rejected by relay server");
        Ok(false)
    }
}

async fn try_agent<H>(handle: &mut Handle<H>, username: &str) -> Result<bool>
where
    H: client::Handler,
{
    let mut agent = match connect_agent().await {
        Some(agent) => agent,
        None => return Ok(false),
    };

    let keys = match agent.request_identities().await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::debug!(error = %e, "Could not list agent keys");
            return Ok(false);
        }
    };

    for key in &keys {
        tracing::debug!(algorithm = %key.algorithm(), comment = key.comment(), "Trying agent key");
        match handle
            .authenticate_publickey_with(username, key.clone(), None, &mut AgentSigner { agent: &mut agent })
            .await
        {
            Ok(result) if result.success() => {
                tracing::info!(comment = key.comment(), "Authenticated with agent key");
                return Ok(true);
            }
            Ok(_) => tracing::debug!(comment = key.comment(), "Agent key rejected"),
            Err(e) => tracing::warn!(comment = key.comment(), error = %e, "Agent signing failed"),
        }
    }

    Ok(false)
}

#[cfg(unix)]
async fn connect_agent() -> Option<DynAgent> {
    match AgentClient::connect_env().await {
        Ok(agent) => Some(agent.dynamic()),
        Err(e) => {
            tracing::debug!(error = %e, "SSH agent unavailable");
            None
        }
    }
}

#[cfg(windows)]
async fn connect_agent() -> Option<DynAgent> {
    match AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent").await {
        Ok(agent) => Some(agent.dynamic()),
        Err(e) => {
            tracing::debug!(error = %e, "SSH agent unavailable");
            None
        }
    }
}

#[cfg(not(any(unix, windows)))]
async fn connect_agent() -> Option<DynAgent> {
    None
}
