use std::collections::HashMap;
use std::fmt::Write;

use bytes::Bytes;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::protocol::handshake::DEFAULT_COLLATION;
use crate::protocol::ClientCommand;

pub const SALT_LEN: usize = 20;

/// Protocol-level identity of one client connection
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: u64,
    /// Negotiated capability flags
    pub capability: u32,
    pub collation: u8,
    pub user: String,
    pub database: Option<String>,
    /// Connection attributes sent by the client
    pub attrs: HashMap<String, String>,
    salt: [u8; SALT_LEN],
    token: Option<String>,
}

impl Session {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            capability: 0,
            collation: DEFAULT_COLLATION,
            user: String::new(),
            database: None,
            attrs: HashMap::new(),
            salt: generate_salt(),
            token: None,
        }
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Credential used to re-authenticate against a new backend
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Assign the session token; the first assignment wins
    pub(crate) fn establish_token(&mut self, configured: Option<&str>) {
        if self.token.is_none() {
            self.token = Some(match configured {
                Some(token) => token.to_string(),
                None => self.derive_token(),
            });
        }
    }

    fn derive_token(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.user.as_bytes());
        hasher.update(self.connection_id.to_le_bytes());
        hasher.update(self.salt);
        hasher.finalize().iter().fold(String::with_capacity(40), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }

    /// Apply the session effects of a command the backend accepted
    pub fn observe_command(&mut self, request: &Bytes) {
        match ClientCommand::parse(request, self.capability) {
            ClientCommand::ChangeUser {
                user,
                database,
                collation,
            } => {
                self.user = user;
                self.database = database;
                if let Some(collation) = collation {
                    self.collation = collation;
                }
            }
            cmd => {
                if let Some(db) = cmd.selected_database() {
                    self.database = Some(db);
                }
            }
        }
    }
}

/// Printable random bytes, as MySQL servers generate them
fn generate_salt() -> [u8; SALT_LEN] {
    let mut rng = rand::thread_rng();
    std::array::from_fn(|_| rng.gen_range(33u8..127))
}
