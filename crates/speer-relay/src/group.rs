//! Group signaling sessions.
//!
//! An initiator names the members of a group; each member answers with its
//! own negotiation payload. Once every member has answered, the initiator
//! receives all payloads at once and the session is discarded. Sessions that
//! never complete expire after a TTL.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use speer_core::Identity;

/// Length of relay-generated group ids.
pub const GROUP_ID_LENGTH: usize = 16;

/// Generate a fresh group id.
pub fn generate_group_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GROUP_ID_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Debug, Default)]
struct MemberState {
    validated: bool,
    payload: Value,
}

#[derive(Debug)]
struct GroupSession {
    initiator: Identity,
    members: BTreeMap<Identity, MemberState>,
    created_at: Instant,
}

/// Result of a member's answer.
#[derive(Debug, PartialEq)]
pub enum Validation {
    /// No session with that id.
    UnknownGroup,
    /// The sender is not a member of the group.
    NotMember,
    /// Recorded; other members have yet to answer.
    Pending {
        /// Members still expected.
        remaining: usize,
    },
    /// Every member answered. The session is gone.
    Complete {
        /// Who started the group.
        initiator: Identity,
        /// Each member's payload, keyed by identity.
        payloads: Map<String, Value>,
    },
}

/// Open group sessions keyed by group id.
pub struct GroupSessions {
    sessions: Mutex<HashMap<String, GroupSession>>,
    ttl: Duration,
}

impl GroupSessions {
    /// Create an empty table with the given session lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Open a session. An existing session with the same id is replaced.
    pub async fn create(&self, group_id: &str, initiator: Identity, members: &[Identity]) {
        let members = members
            .iter()
            .map(|member| (member.clone(), MemberState::default()))
            .collect();
        info!(group = %group_id, initiator = %initiator.redacted(), "Group session opened");
        self.sessions.lock().await.insert(
            group_id.to_string(),
            GroupSession {
                initiator,
                members,
                created_at: Instant::now(),
            },
        );
    }

    /// Record `member`'s answer for `group_id`.
    pub async fn validate(&self, group_id: &str, member: &Identity, payload: Value) -> Validation {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(group_id) else {
            return Validation::UnknownGroup;
        };
        let Some(state) = session.members.get_mut(member) else {
            return Validation::NotMember;
        };
        state.validated = true;
        state.payload = payload;

        let remaining = session.members.values().filter(|m| !m.validated).count();
        if remaining > 0 {
            debug!(group = %group_id, remaining, "Group member validated");
            return Validation::Pending { remaining };
        }

        let Some(session) = sessions.remove(group_id) else {
            return Validation::UnknownGroup;
        };
        info!(group = %group_id, members = session.members.len(), "Group session complete");
        let payloads = session
            .members
            .into_iter()
            .map(|(identity, state)| (identity.to_string(), state.payload))
            .collect();
        Validation::Complete {
            initiator: session.initiator,
            payloads,
        }
    }

    /// Number of open sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session is open.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Drop sessions older than the TTL and return how many went.
    pub async fn expire(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        let ttl = self.ttl;
        sessions.retain(|_, session| session.created_at.elapsed() < ttl);
        before - sessions.len()
    }

    /// Expire stale sessions every `period` until the table is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let groups = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(groups) = groups.upgrade() else {
                    break;
                };
                let expired = groups.expire().await;
                if expired > 0 {
                    let open = groups.len().await;
                    info!(expired, open, "Group cleanup completed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(names: &[&str]) -> Vec<Identity> {
        names.iter().map(|n| Identity::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_group_completes_when_all_members_answer() {
        let groups = GroupSessions::new(Duration::from_secs(60));
        groups.create("g1", Identity::from("alice"), &ids(&["bob", "carol"])).await;

        let bob = Identity::from("bob");
        let carol = Identity::from("carol");
        assert_eq!(
            groups.validate("g1", &bob, json!("bob-offer")).await,
            Validation::Pending { remaining: 1 }
        );
        // A repeated answer overwrites the payload without completing.
        assert_eq!(
            groups.validate("g1", &bob, json!("bob-offer-2")).await,
            Validation::Pending { remaining: 1 }
        );

        match groups.validate("g1", &carol, json!("carol-offer")).await {
            Validation::Complete { initiator, payloads } => {
                assert_eq!(initiator.as_str(), "alice");
                assert_eq!(payloads.get("bob"), Some(&json!("bob-offer-2")));
                assert_eq!(payloads.get("carol"), Some(&json!("carol-offer")));
            }
            other => panic!("unexpected validation: {:?}", other),
        }
        assert!(groups.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_member_and_unknown_group() {
        let groups = GroupSessions::new(Duration::from_secs(60));
        groups.create("g1", Identity::from("alice"), &ids(&["bob"])).await;

        let mallory = Identity::from("mallory");
        assert_eq!(groups.validate("g1", &mallory, Value::Null).await, Validation::NotMember);
        assert_eq!(groups.validate("g2", &mallory, Value::Null).await, Validation::UnknownGroup);
        assert_eq!(groups.len().await, 1);
    }

    #[tokio::test]
    async fn test_expire_drops_stale_sessions() {
        let groups = GroupSessions::new(Duration::ZERO);
        groups.create("g1", Identity::from("alice"), &ids(&["bob"])).await;
        assert_eq!(groups.expire().await, 1);
        assert!(groups.is_empty().await);

        let groups = GroupSessions::new(Duration::from_secs(60));
        groups.create("g1", Identity::from("alice"), &ids(&["bob"])).await;
        assert_eq!(groups.expire().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_expires_sessions() {
        let groups = Arc::new(GroupSessions::new(Duration::from_millis(10)));
        groups.create("g1", Identity::from("alice"), &ids(&["bob"])).await;

        let cleanup = groups.spawn_cleanup(Duration::from_millis(20));
        for _ in 0..100 {
            if groups.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cleanup.abort();
        assert!(groups.is_empty().await);
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_group_id();
        assert_eq!(a.len(), GROUP_ID_LENGTH);
        assert_ne!(a, generate_group_id());
    }
}
