use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::SignalError;

/// Kind of media session being negotiated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Video,
    Audio,
    Data,
}

impl Default for CallType {
    fn default() -> Self {
        CallType::Video
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Video => write!(f, "video"),
            CallType::Audio => write!(f, "audio"),
            CallType::Data => write!(f, "data"),
        }
    }
}

/// Lifecycle states of one call attempt.
///
/// `pending -> {accepted, declined, ended, expired}` and
/// `accepted -> {ended, expired}`. The four right-hand states are terminal:
/// no transition ever leaves them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Accepted,
    Declined,
    Ended,
    Expired,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Ended | CallStatus::Expired
        )
    }

    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match self {
            CallStatus::Pending => next != CallStatus::Pending,
            CallStatus::Accepted => {
                matches!(next, CallStatus::Ended | CallStatus::Expired)
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Accepted => "accepted",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
            CallStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call left the pending/accepted states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Ended,
    Declined,
    Timeout,
    Error,
}

impl Default for EndReason {
    fn default() -> Self {
        EndReason::Ended
    }
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Ended => "ended",
            EndReason::Declined => "declined",
            EndReason::Timeout => "timeout",
            EndReason::Error => "error",
        }
    }

    /// Terminal status this reason resolves the session to.
    pub fn target_status(&self) -> CallStatus {
        match self {
            EndReason::Declined => CallStatus::Declined,
            _ => CallStatus::Ended,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call attempt between two users. Owned by the coordinator's session
/// store; the SDP blobs are opaque to this server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub caller_id: i64,
    pub target_user_id: i64,
    pub call_type: CallType,
    pub sdp_offer: serde_json::Value,
    #[serde(default)]
    pub sdp_answer: Option<serde_json::Value>,
    pub status: CallStatus,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl CallSession {
    /// Create a new pending session for an outgoing offer. `expires_at` is
    /// fixed at creation and never extended.
    pub fn new_offer(
        caller_id: i64,
        target_user_id: i64,
        call_type: CallType,
        sdp_offer: serde_json::Value,
        ring_timeout: Duration,
    ) -> Result<Self, SignalError> {
        if caller_id == target_user_id {
            return Err(SignalError::InvalidSelfCall);
        }
        let now = Utc::now();
        Ok(Self {
            call_id: generate_call_id(),
            caller_id,
            target_user_id,
            call_type,
            sdp_offer,
            sdp_answer: None,
            status: CallStatus::Pending,
            end_reason: None,
            created_at: now,
            expires_at: now + ring_timeout,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// The user on the other side of the call from `user_id`.
    pub fn counterpart_of(&self, user_id: i64) -> i64 {
        if user_id == self.caller_id {
            self.target_user_id
        } else {
            self.caller_id
        }
    }

    /// Copy of this session moved to `accepted` with the answer attached.
    pub fn accepted_with(&self, sdp_answer: serde_json::Value) -> CallSession {
        let mut next = self.clone();
        next.status = CallStatus::Accepted;
        next.sdp_answer = Some(sdp_answer);
        next
    }

    /// Copy of this session resolved with `reason`. An accepted call can
    /// only end, so a late decline resolves it to `ended` while keeping the
    /// reason tag.
    pub fn resolved_with(&self, reason: EndReason) -> CallSession {
        let mut next = self.clone();
        let target = reason.target_status();
        next.status = if self.status.can_transition_to(target) {
            target
        } else {
            CallStatus::Ended
        };
        next.end_reason = Some(reason);
        next
    }

    /// Copy of this session marked expired by the sweeper.
    pub fn expired(&self) -> CallSession {
        let mut next = self.clone();
        next.status = CallStatus::Expired;
        next.end_reason = Some(EndReason::Timeout);
        next
    }
}

/// Generate a globally unique call ID.
pub fn generate_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer(caller: i64, target: i64) -> CallSession {
        CallSession::new_offer(
            caller,
            target,
            CallType::Audio,
            json!({"type": "offer", "sdp": "v=0"}),
            Duration::seconds(60),
        )
        .unwrap()
    }

    #[test]
    fn call_ids_are_unique() {
        let a = generate_call_id();
        let b = generate_call_id();
        assert_ne!(a, b);
        assert!(a.starts_with("call_"));
    }

    #[test]
    fn self_call_is_rejected() {
        let err = CallSession::new_offer(
            7,
            7,
            CallType::Video,
            json!({"type": "offer", "sdp": "v=0"}),
            Duration::seconds(60),
        )
        .unwrap_err();
        assert!(matches!(err, SignalError::InvalidSelfCall));
    }

    #[test]
    fn new_offer_starts_pending_with_ring_deadline() {
        let session = offer(1, 2);
        assert_eq!(session.status, CallStatus::Pending);
        assert_eq!(session.expires_at - session.created_at, Duration::seconds(60));
        assert!(session.sdp_answer.is_none());
        assert!(!session.is_expired(session.created_at));
        assert!(session.is_expired(session.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn terminal_states_admit_no_transition() {
        for terminal in [CallStatus::Declined, CallStatus::Ended, CallStatus::Expired] {
            assert!(terminal.is_terminal());
            for next in [
                CallStatus::Pending,
                CallStatus::Accepted,
                CallStatus::Declined,
                CallStatus::Ended,
                CallStatus::Expired,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn accepted_can_only_end_or_expire() {
        let accepted = CallStatus::Accepted;
        assert!(!accepted.is_terminal());
        assert!(accepted.can_transition_to(CallStatus::Ended));
        assert!(accepted.can_transition_to(CallStatus::Expired));
        assert!(!accepted.can_transition_to(CallStatus::Accepted));
        assert!(!accepted.can_transition_to(CallStatus::Declined));
        assert!(!accepted.can_transition_to(CallStatus::Pending));
    }

    #[test]
    fn end_reason_maps_to_terminal_status() {
        assert_eq!(EndReason::Declined.target_status(), CallStatus::Declined);
        assert_eq!(EndReason::Ended.target_status(), CallStatus::Ended);
        assert_eq!(EndReason::Timeout.target_status(), CallStatus::Ended);
        assert_eq!(EndReason::Error.target_status(), CallStatus::Ended);
    }

    #[test]
    fn late_decline_of_accepted_call_resolves_to_ended() {
        let accepted = offer(1, 2).accepted_with(json!({"type": "answer", "sdp": "v=0"}));
        let resolved = accepted.resolved_with(EndReason::Declined);
        assert_eq!(resolved.status, CallStatus::Ended);
        assert_eq!(resolved.end_reason, Some(EndReason::Declined));
    }

    #[test]
    fn counterpart_resolves_either_direction() {
        let session = offer(1, 2);
        assert_eq!(session.counterpart_of(1), 2);
        assert_eq!(session.counterpart_of(2), 1);
    }

    #[test]
    fn session_row_round_trips_through_json() {
        let session = offer(1, 2).accepted_with(json!({"type": "answer", "sdp": "v=0"}));
        let raw = serde_json::to_string(&session).unwrap();
        let back: CallSession = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.status, CallStatus::Accepted);
        assert_eq!(back.call_id, session.call_id);
        assert_eq!(back.sdp_answer, session.sdp_answer);
    }
}
