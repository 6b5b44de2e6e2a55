//! 上传会话：按会话令牌记住每个目标文件最近一次确认的偏移。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::storage::UploadPaths;

#[derive(Clone, Debug)]
pub struct UploadSession {
    pub session_id: String,
    pub target_name: String,
    pub storage_path: PathBuf,
    /// Offset the server last reported for this target, if any.
    pub last_known_offset: Option<u64>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, UploadSession>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Looks up the live session `token` for `paths`, or starts a new one.
    ///
    /// A token that is unknown, expired or bound to a different target is
    /// ignored. The returned flag is true when a new session was created.
    pub async fn open(&self, token: Option<&str>, paths: &UploadPaths) -> (UploadSession, bool) {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        if let Some(token) = token
            && let Some(session) = sessions.get_mut(token)
        {
            if session.expires_at > now && session.target_name == paths.key {
                session.expires_at = now + self.ttl;
                return (session.clone(), false);
            }
            sessions.remove(token);
        }

        let session = UploadSession {
            session_id: Uuid::new_v4().to_string(),
            target_name: paths.key.clone(),
            storage_path: paths.final_path.clone(),
            last_known_offset: None,
            expires_at: now + self.ttl,
        };
        sessions.insert(session.session_id.clone(), session.clone());
        (session, true)
    }

    pub async fn record_offset(&self, session_id: &str, offset: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_known_offset = Some(offset);
            session.expires_at = Instant::now() + self.ttl;
        }
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    /// Drops every session bound to the upload key `target_name`.
    pub async fn remove_target(&self, target_name: &str) {
        self.sessions
            .lock()
            .await
            .retain(|_, session| session.target_name != target_name);
    }

    /// 清理过期会话，返回清理数量。
    pub async fn prune_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        let now = Instant::now();
        sessions.retain(|_, session| session.expires_at > now);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(name: &str) -> UploadPaths {
        UploadPaths::new(name.to_string(), PathBuf::from("/srv").join(name))
    }

    #[tokio::test]
    async fn token_resumes_its_own_target_only() {
        let store = SessionStore::new(Duration::from_secs(60));
        let a = paths("a.bin");
        let (session, created) = store.open(None, &a).await;
        assert!(created);
        assert_eq!(session.last_known_offset, None);
        store.record_offset(&session.session_id, 500).await;

        let (again, created) = store.open(Some(&session.session_id), &a).await;
        assert!(!created);
        assert_eq!(again.session_id, session.session_id);
        assert_eq!(again.last_known_offset, Some(500));

        let (other, created) = store.open(Some(&session.session_id), &paths("b.bin")).await;
        assert!(created);
        assert_ne!(other.session_id, session.session_id);
        assert_eq!(store.len().await, 1, "mismatched token is discarded");
    }

    #[tokio::test]
    async fn expired_sessions_are_pruned() {
        let store = SessionStore::new(Duration::ZERO);
        let (session, _) = store.open(None, &paths("a.bin")).await;
        let (_, created) = store.open(Some(&session.session_id), &paths("a.bin")).await;
        assert!(created, "expired token starts over");
        assert_eq!(store.prune_expired().await, 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn remove_target_drops_all_sessions_for_key() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.open(None, &paths("a.bin")).await;
        store.open(None, &paths("a.bin")).await;
        let (keep, _) = store.open(None, &paths("b.bin")).await;
        store.remove_target("a.bin").await;
        assert_eq!(store.len().await, 1);
        store.remove(&keep.session_id).await;
        assert_eq!(store.len().await, 0);
    }
}
