//! IPMI v1.5 session table
//!
//! Tracks outstanding session challenges and activated sessions for one
//! listener. Both maps are bounded; idle entries expire.

use crate::packet::{AuthType, Privilege};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Maximum number of activated sessions per listener
pub const MAX_SESSIONS: usize = 16;

/// Maximum number of outstanding challenges per listener
pub const MAX_PENDING_CHALLENGES: usize = 16;

/// Default idle timeout for sessions and challenges
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Challenge handed out by Get Session Challenge
#[derive(Debug, Clone)]
struct PendingChallenge {
    challenge: [u8; 16],
    issued: Instant,
}

/// An activated session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u32,
    pub auth_type: AuthType,
    pub max_privilege: Privilege,
    pub privilege: Privilege,
    outbound_sequence: u32,
    last_activity: Instant,
}

impl Session {
    /// Sequence number for the next response, skipping zero
    pub fn next_outbound_sequence(&mut self) -> u32 {
        let seq = self.outbound_sequence;
        self.outbound_sequence = self.outbound_sequence.wrapping_add(1);
        if self.outbound_sequence == 0 {
            self.outbound_sequence = 1;
        }
        seq
    }
}

/// Reasons Activate Session can be refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateError {
    /// No outstanding challenge for the temporary session id
    UnknownChallenge,
    /// Challenge bytes do not match the ones issued
    ChallengeMismatch,
    /// Session table full
    NoSessionSlot,
}

/// Session state of one listener
#[derive(Debug)]
pub struct SessionTable {
    pending: HashMap<u32, PendingChallenge>,
    active: HashMap<u32, Session>,
    idle_timeout: Duration,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl SessionTable {
    /// Create an empty table
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            active: HashMap::new(),
            idle_timeout,
        }
    }

    /// Drop challenges and sessions idle for longer than the timeout
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.idle_timeout;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.issued) <= timeout);
        self.active.retain(|id, s| {
            let keep = now.saturating_duration_since(s.last_activity) <= timeout;
            if !keep {
                debug!(session_id = format_args!("{:#010x}", id), "Session expired");
            }
            keep
        });
    }

    /// Issue a new challenge, returning the temporary session id
    ///
    /// When the table of challenges is full the oldest one is evicted.
    pub fn issue_challenge(&mut self, now: Instant) -> (u32, [u8; 16]) {
        if self.pending.len() >= MAX_PENDING_CHALLENGES {
            if let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.issued)
                .map(|(id, _)| *id)
            {
                self.pending.remove(&oldest);
            }
        }

        let temp_id = self.unused_id();
        let challenge: [u8; 16] = rand::random();
        self.pending.insert(
            temp_id,
            PendingChallenge {
                challenge,
                issued: now,
            },
        );
        (temp_id, challenge)
    }

    /// Whether a temporary session id has an outstanding challenge
    pub fn has_challenge(&self, temp_id: u32) -> bool {
        self.pending.contains_key(&temp_id)
    }

    /// Turn an outstanding challenge into an active session
    ///
    /// The session starts at User privilege; the console raises it with
    /// Set Session Privilege Level.
    pub fn activate(
        &mut self,
        temp_id: u32,
        challenge: &[u8],
        auth_type: AuthType,
        max_privilege: Privilege,
        initial_outbound_sequence: u32,
        now: Instant,
    ) -> Result<&mut Session, ActivateError> {
        let pending = self
            .pending
            .get(&temp_id)
            .ok_or(ActivateError::UnknownChallenge)?;
        if pending.challenge.as_slice() != challenge {
            return Err(ActivateError::ChallengeMismatch);
        }
        if self.active.len() >= MAX_SESSIONS {
            return Err(ActivateError::NoSessionSlot);
        }
        self.pending.remove(&temp_id);

        let id = self.unused_id();
        let session = Session {
            id,
            auth_type,
            max_privilege,
            privilege: Privilege::User.min(max_privilege),
            outbound_sequence: initial_outbound_sequence.max(1),
            last_activity: now,
        };
        Ok(self.active.entry(id).or_insert(session))
    }

    /// Look up an active session, refreshing its idle timer
    pub fn touch(&mut self, id: u32, now: Instant) -> Option<&mut Session> {
        let session = self.active.get_mut(&id)?;
        session.last_activity = now;
        Some(session)
    }

    /// Look up an active session without refreshing it
    pub fn get(&self, id: u32) -> Option<&Session> {
        self.active.get(&id)
    }

    /// Remove an active session
    pub fn close(&mut self, id: u32) -> Option<Session> {
        self.active.remove(&id)
    }

    /// Number of active sessions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn unused_id(&self) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != 0 && !self.pending.contains_key(&id) && !self.active.contains_key(&id) {
                return id;
            }
        }
    }
}
