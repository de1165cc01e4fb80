//! REGISTER handling: credential storage and digest validation.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
struct UserEntry {
    password: String,
    address: Option<IpAddr>,
    registered_at: Option<SystemTime>,
    registered: bool,
}

/// Management view of one user.
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub user: String,
    pub registered: bool,
    pub address: Option<IpAddr>,
    /// How long ago the user registered
    pub registered_for: Option<Duration>,
}

/// Digest-authenticating registrar.
///
/// Users with an empty stored password register unchallenged. Everyone else
/// must present `md5(hex(HA1):nonce:hex(HA2))` where
/// `HA1 = md5(user:realm:password)` and `HA2 = md5("REGISTER":uri)`.
#[derive(Debug, Default)]
pub struct Registrar {
    users: RwLock<HashMap<String, UserEntry>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a user. An empty password disables the challenge.
    pub fn add_user(&self, user: &str, password: &str) {
        self.users.write().insert(
            user.to_string(),
            UserEntry {
                password: password.to_string(),
                ..UserEntry::default()
            },
        );
    }

    /// Load `user[,password]` lines from `path`. Missing files are fine;
    /// the registrar just starts empty.
    pub fn load_file(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            debug!(path = %path.display(), "no credential file, registrar starts empty");
            return Ok(0);
        }
        let contents = fs::read_to_string(path)
            .map_err(|err| Error::registrar(format!("read {}: {}", path.display(), err)))?;

        let mut count = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(',') {
                Some((user, password)) => self.add_user(user, password),
                None => self.add_user(line, ""),
            }
            count += 1;
        }
        info!(users = count, path = %path.display(), "credential file loaded");
        Ok(count)
    }

    /// Write the credential table back in the same `user[,password]` format.
    pub fn save_file(&self, path: &Path) -> Result<()> {
        let users = self.users.read();
        let mut out = String::new();
        for (user, entry) in users.iter() {
            if entry.password.is_empty() {
                out.push_str(user);
            } else {
                out.push_str(user);
                out.push(',');
                out.push_str(&entry.password);
            }
            out.push('\n');
        }
        fs::write(path, out)
            .map_err(|err| Error::registrar(format!("write {}: {}", path.display(), err)))
    }

    /// Validate a REGISTER and record the binding on success.
    ///
    /// Unknown users fail. Users with an empty password always succeed. The
    /// digest comparison is case-insensitive.
    pub fn register(
        &self,
        user: &str,
        address: IpAddr,
        realm: &str,
        nonce: &str,
        uri: &str,
        response: Option<&str>,
    ) -> bool {
        let mut users = self.users.write();
        let Some(entry) = users.get_mut(user) else {
            warn!(user, "REGISTER for unknown user");
            return false;
        };

        if !entry.password.is_empty() {
            let expected = digest_response(user, &entry.password, realm, "REGISTER", uri, nonce);
            let presented = response.unwrap_or("");
            if !expected.eq_ignore_ascii_case(presented) {
                debug!(user, "digest mismatch");
                return false;
            }
        }

        entry.registered = true;
        entry.address = Some(address);
        entry.registered_at = Some(SystemTime::now());
        info!(user, %address, "user registered");
        true
    }

    /// Clear the registered flag and binding. The credential entry stays.
    pub fn unregister(&self, user: &str) {
        if let Some(entry) = self.users.write().get_mut(user) {
            entry.registered = false;
            entry.address = None;
            entry.registered_at = None;
            info!(user, "user unregistered");
        }
    }

    pub fn is_registered(&self, user: &str) -> bool {
        self.users
            .read()
            .get(user)
            .map(|entry| entry.registered)
            .unwrap_or(false)
    }

    /// Management view of every user.
    pub fn snapshot(&self) -> Vec<UserStatus> {
        let now = SystemTime::now();
        self.users
            .read()
            .iter()
            .map(|(user, entry)| UserStatus {
                user: user.clone(),
                registered: entry.registered,
                address: entry.address,
                registered_for: entry
                    .registered_at
                    .and_then(|at| now.duration_since(at).ok()),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// RFC 2617 digest for a REGISTER:
/// `md5(hex(md5(user:realm:password)):nonce:hex(md5(method:uri)))`.
fn digest_response(
    user: &str,
    password: &str,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(format!("{}:{}:{}", user, realm, password).as_bytes());
    let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());
    md5_hex(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes())
}
