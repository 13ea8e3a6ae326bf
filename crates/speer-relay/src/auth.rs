//! Authentication and authorization collaborators.
//!
//! Accounts, sessions and friendships live outside the relay. The relay only
//! asks two questions: who owns this session cookie, and may A signal B.
//! [`StaticDirectory`] answers both from a JSON file:
//!
//! ```json
//! {
//!   "sessions": { "5f2b9c1e": "alice", "8c3f4e6b": "bob" },
//!   "friendships": [["alice", "bob"]]
//! }
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use speer_core::{Error, Identity, Result, SESSION_COOKIE};

/// Resolves a session credential to its owner.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Owner of `credential`, if the session is valid.
    async fn resolve(&self, credential: &str) -> Option<Identity>;
}

/// Friendship oracle.
#[async_trait]
pub trait FriendshipGate: Send + Sync {
    /// True iff `from` and `to` are mutual friends.
    async fn authorize_signal(&self, from: &Identity, to: &Identity) -> bool;

    /// Every friend of `identity`.
    async fn friends_of(&self, identity: &Identity) -> Vec<Identity>;
}

/// Extract the session credential from a `Cookie` header value.
pub fn session_from_cookie(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    sessions: HashMap<String, Identity>,
    #[serde(default)]
    friendships: Vec<(Identity, Identity)>,
}

/// In-memory session and friendship directory.
#[derive(Default)]
pub struct StaticDirectory {
    sessions: RwLock<HashMap<String, Identity>>,
    friends: RwLock<HashMap<Identity, HashSet<Identity>>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a directory document.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: DirectoryFile =
            serde_json::from_str(text).map_err(|e| Error::Directory(e.to_string()))?;

        let mut friends: HashMap<Identity, HashSet<Identity>> = HashMap::new();
        for (a, b) in file.friendships {
            if a == b {
                return Err(Error::Directory(format!("{} cannot befriend itself", a)));
            }
            friends.entry(a.clone()).or_default().insert(b.clone());
            friends.entry(b).or_default().insert(a);
        }

        Ok(Self {
            sessions: RwLock::new(file.sessions),
            friends: RwLock::new(friends),
        })
    }

    /// Load a directory file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Directory(format!("{}: {}", path.display(), e)))?;
        let directory = Self::from_json(&text)?;
        info!(
            path = %path.display(),
            sessions = directory.sessions.read().await.len(),
            "Directory loaded"
        );
        Ok(directory)
    }

    /// Issue `credential` to `identity`.
    pub async fn add_session(&self, credential: impl Into<String>, identity: Identity) {
        self.sessions.write().await.insert(credential.into(), identity);
    }

    /// Revoke `credential`.
    pub async fn revoke_session(&self, credential: &str) {
        self.sessions.write().await.remove(credential);
    }

    /// Make `a` and `b` mutual friends.
    pub async fn befriend(&self, a: &Identity, b: &Identity) {
        let mut friends = self.friends.write().await;
        friends.entry(a.clone()).or_default().insert(b.clone());
        friends.entry(b.clone()).or_default().insert(a.clone());
    }

    /// End the friendship between `a` and `b`.
    pub async fn unfriend(&self, a: &Identity, b: &Identity) {
        let mut friends = self.friends.write().await;
        if let Some(set) = friends.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = friends.get_mut(b) {
            set.remove(a);
        }
    }
}

#[async_trait]
impl SessionResolver for StaticDirectory {
    async fn resolve(&self, credential: &str) -> Option<Identity> {
        self.sessions.read().await.get(credential).cloned()
    }
}

#[async_trait]
impl FriendshipGate for StaticDirectory {
    async fn authorize_signal(&self, from: &Identity, to: &Identity) -> bool {
        let friends = self.friends.read().await;
        let forward = friends.get(from).is_some_and(|set| set.contains(to));
        let backward = friends.get(to).is_some_and(|set| set.contains(from));
        forward && backward
    }

    async fn friends_of(&self, identity: &Identity) -> Vec<Identity> {
        let mut friends: Vec<Identity> = self
            .friends
            .read()
            .await
            .get(identity)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        friends.sort();
        friends
    }
}
