use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SignalError, MAX_PUSH_PAYLOAD_BYTES};
use crate::session::{CallType, EndReason};

/// An ICE network-path descriptor, relayed opaquely. Field casing matches
/// the browser's RTCIceCandidate JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
}

/// One relayed signaling event. This is the full closed set: every event
/// carried over the push channel is one of these four, and each encodes to
/// a self-describing `{type, call_id, ...}` object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SignalingEvent {
    /// Incoming call: the caller's SDP offer.
    #[serde(rename = "webrtc_send_sdp")]
    Offer {
        call_id: String,
        call_type: CallType,
        caller_id: i64,
        target_user_id: i64,
        sdp: serde_json::Value,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        badge: Option<u64>,
    },
    /// Call answered: the responder's SDP answer, delivered to the caller.
    #[serde(rename = "webrtc_receive_sdp")]
    Answer {
        call_id: String,
        call_type: CallType,
        caller_user_id: i64,
        responder_id: i64,
        sdp: serde_json::Value,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        badge: Option<u64>,
    },
    /// Connection-establishment path candidate. Silent: never bumps the
    /// badge count.
    #[serde(rename = "webrtc_ice_candidate")]
    IceCandidate {
        call_id: String,
        sender_id: i64,
        target_user_id: i64,
        ice_candidate: IceCandidate,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },
    /// The call was resolved (hung up, declined, timed out, errored).
    #[serde(rename = "webrtc_call_ended")]
    CallEnded {
        call_id: String,
        reason: EndReason,
        ended_by_user_id: i64,
        target_user_id: i64,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: DateTime<Utc>,
    },
}

/// Serialize an event into a transport payload, enforcing the push-channel
/// size ceiling. Oversized payloads are rejected here, before any fan-out.
pub fn encode(event: &SignalingEvent) -> Result<Vec<u8>, SignalError> {
    let bytes = serde_json::to_vec(event)
        .map_err(|e| SignalError::Storage(anyhow::anyhow!("event serialization failed: {e}")))?;
    validate_size(&bytes)?;
    Ok(bytes)
}

/// Check a payload against the hard channel ceiling.
pub fn validate_size(bytes: &[u8]) -> Result<(), SignalError> {
    if bytes.len() > MAX_PUSH_PAYLOAD_BYTES {
        return Err(SignalError::too_large(bytes.len()));
    }
    Ok(())
}

pub fn decode(bytes: &[u8]) -> Result<SignalingEvent, SignalError> {
    serde_json::from_slice(bytes)
        .map_err(|_| SignalError::Validation("unrecognized signaling payload"))
}
