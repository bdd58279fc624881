//! Session bookkeeping (`.swarm/state/session.json`).
//!
//! The uid counter is checkpointed here after every batch of issues so that a
//! resumed session never reissues a uid.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::uid::UidCounter;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: String,
    /// Next uid the counter will hand out.
    pub next_uid: u32,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            session_id: format!("session-{}", now.format("%Y%m%dT%H%M%SZ")),
            next_uid: 1,
            started_at: now,
        }
    }

    /// A counter positioned where this session left off.
    pub fn uid_counter(&self) -> UidCounter {
        UidCounter::starting_at(self.next_uid)
    }
}

pub fn load_session(path: &Path) -> Result<SessionState> {
    debug!(path = %path.display(), "loading session");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    let state: SessionState = serde_json::from_str(&contents)
        .with_context(|| format!("parse session {}", path.display()))?;
    debug!(session_id = %state.session_id, next_uid = state.next_uid, "session loaded");
    Ok(state)
}

/// Load the session, or start (and persist) a fresh one if none exists.
pub fn load_or_start_session(path: &Path, now: DateTime<Utc>) -> Result<SessionState> {
    if path.exists() {
        return load_session(path);
    }
    let state = SessionState::start(now);
    write_session(path, &state)?;
    Ok(state)
}

pub fn write_session(path: &Path, state: &SessionState) -> Result<()> {
    debug!(
        path = %path.display(),
        session_id = %state.session_id,
        next_uid = state.next_uid,
        "writing session"
    );
    write_json_atomic(path, state)
}

/// Record the counter's current position into the session file.
pub fn checkpoint_uids(path: &Path, uids: &UidCounter) -> Result<SessionState> {
    let mut state = load_session(path)?;
    state.next_uid = state.next_uid.max(uids.peek());
    write_session(path, &state)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");
        let state = SessionState {
            session_id: "session-1".to_string(),
            next_uid: 42,
            started_at: Utc::now(),
        };

        write_session(&path, &state).expect("write");
        assert_eq!(load_session(&path).expect("load"), state);
    }

    #[test]
    fn load_or_start_creates_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("session.json");

        let first = load_or_start_session(&path, Utc::now()).expect("start");
        assert_eq!(first.next_uid, 1);
        let second = load_or_start_session(&path, Utc::now()).expect("resume");
        assert_eq!(first, second);
    }

    #[test]
    fn checkpoint_never_moves_backwards() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");
        let mut state = SessionState::start(Utc::now());
        state.next_uid = 10;
        write_session(&path, &state).expect("write");

        let uids = UidCounter::new();
        uids.issue().expect("issue");
        assert_eq!(checkpoint_uids(&path, &uids).expect("checkpoint").next_uid, 10);

        let uids = state.uid_counter();
        for _ in 0..5 {
            uids.issue().expect("issue");
        }
        assert_eq!(checkpoint_uids(&path, &uids).expect("checkpoint").next_uid, 15);
    }
}
