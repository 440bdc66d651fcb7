use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::SignalError;
use crate::payload::{self, IceCandidate, SignalingEvent};
use crate::push::Fanout;
use crate::session::{CallSession, CallStatus, CallType, EndReason};
use crate::storage::Store;

/// Result of dispatching an offer.
#[derive(Debug)]
pub struct OfferOutcome {
    pub call_id: String,
    pub delivered: bool,
}

/// Orchestrates inbound signaling requests: validates, drives the call
/// session state machine, encodes the event and hands it to the fan-out
/// engine. Push delivery is best effort; the badge counter is the durable
/// signal that an event occurred.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    fanout: Fanout,
    ring_timeout: Duration,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, fanout: Fanout, ring_timeout: Duration) -> Self {
        Self {
            store,
            fanout,
            ring_timeout,
        }
    }

    /// Create a pending call session and push the offer to the target.
    pub async fn send_offer(
        &self,
        caller_id: i64,
        target_user_id: i64,
        call_type: CallType,
        sdp: serde_json::Value,
    ) -> Result<OfferOutcome, SignalError> {
        if caller_id == target_user_id {
            return Err(SignalError::InvalidSelfCall);
        }
        if !self.store.user_reachable(target_user_id).await? {
            return Err(SignalError::NotFound("target user"));
        }

        let session =
            CallSession::new_offer(caller_id, target_user_id, call_type, sdp, self.ring_timeout)?;
        self.store.insert_session(&session).await?;

        // Badge reflects "event occurred" regardless of delivery outcome,
        // but only once the session exists.
        let badge = self.store.increment_badge(target_user_id).await?;

        let event = SignalingEvent::Offer {
            call_id: session.call_id.clone(),
            call_type: session.call_type,
            caller_id,
            target_user_id,
            sdp: session.sdp_offer.clone(),
            timestamp: Utc::now(),
            badge: Some(badge),
        };
        let bytes = payload::encode(&event)?;
        let delivered = self.deliver_best_effort(target_user_id, &bytes).await;

        info!(
            call = %session.call_id,
            caller = %caller_id,
            target = %target_user_id,
            call_type = %session.call_type,
            delivered,
            "call offer dispatched"
        );
        Ok(OfferOutcome {
            call_id: session.call_id,
            delivered,
        })
    }

    /// Accept a pending call and push the answer back to the caller.
    pub async fn send_answer(
        &self,
        responder_id: i64,
        caller_user_id: i64,
        call_id: &str,
        sdp: serde_json::Value,
    ) -> Result<bool, SignalError> {
        let session = self
            .store
            .get_session(call_id)
            .await?
            .ok_or(SignalError::NotFound("call"))?;
        if session.caller_id != caller_user_id {
            return Err(SignalError::NotFound("call"));
        }
        if responder_id != session.target_user_id {
            return Err(SignalError::Validation("answer must come from the call target"));
        }
        if session.status.is_terminal() {
            return Err(SignalError::InvalidTransition {
                call_id: call_id.to_string(),
                status: session.status,
            });
        }

        let now = Utc::now();
        if session.is_expired(now) {
            // Surface the expiry instead of silently accepting a dead call.
            // Guard on the status actually read so a competing transition
            // makes this swap lose rather than overwrite the winner's row.
            if self
                .store
                .swap_status(call_id, &[session.status], &session.expired())
                .await?
            {
                self.store.remove_expiry(call_id).await?;
            }
            return Err(SignalError::Expired(call_id.to_string()));
        }
        if session.status != CallStatus::Pending {
            return Err(SignalError::InvalidTransition {
                call_id: call_id.to_string(),
                status: session.status,
            });
        }

        let accepted = session.accepted_with(sdp);
        if !self
            .store
            .swap_status(call_id, &[CallStatus::Pending], &accepted)
            .await?
        {
            // Lost a race against a decline/end/sweep; report the winner.
            let status = self
                .store
                .get_session(call_id)
                .await?
                .map(|s| s.status)
                .unwrap_or(CallStatus::Ended);
            return Err(SignalError::InvalidTransition {
                call_id: call_id.to_string(),
                status,
            });
        }

        let badge = self.store.increment_badge(caller_user_id).await?;
        let event = SignalingEvent::Answer {
            call_id: call_id.to_string(),
            call_type: accepted.call_type,
            caller_user_id,
            responder_id,
            sdp: accepted.sdp_answer.clone().unwrap_or_default(),
            timestamp: now,
            badge: Some(badge),
        };
        let bytes = payload::encode(&event)?;
        let delivered = self.deliver_best_effort(caller_user_id, &bytes).await;

        info!(
            call = %call_id,
            responder = %responder_id,
            caller = %caller_user_id,
            delivered,
            "call answer dispatched"
        );
        Ok(delivered)
    }

    /// Relay one ICE candidate to the target. No session transition, no
    /// badge: a silent, fire-and-forget event.
    pub async fn send_ice_candidate(
        &self,
        sender_id: i64,
        target_user_id: i64,
        call_id: &str,
        ice_candidate: IceCandidate,
    ) -> Result<bool, SignalError> {
        if !self.store.user_reachable(target_user_id).await? {
            return Err(SignalError::NotFound("target user"));
        }

        let event = SignalingEvent::IceCandidate {
            call_id: call_id.to_string(),
            sender_id,
            target_user_id,
            ice_candidate,
            timestamp: Utc::now(),
        };
        let bytes = payload::encode(&event)?;
        let delivered = self.deliver_best_effort(target_user_id, &bytes).await;
        if !delivered {
            debug!(call = %call_id, target = %target_user_id, "ice candidate not delivered");
        }
        Ok(delivered)
    }

    /// Resolve a call with `reason` and notify the counterpart. Idempotent:
    /// ending an already-resolved call is a no-op success.
    pub async fn end_call(
        &self,
        acting_user_id: i64,
        target_user_id: i64,
        call_id: &str,
        reason: EndReason,
    ) -> Result<bool, SignalError> {
        let mut session = self
            .store
            .get_session(call_id)
            .await?
            .ok_or(SignalError::NotFound("call"))?;
        // Only the two parties may resolve a call, and the notified side is
        // always the acting user's counterpart.
        if acting_user_id != session.caller_id && acting_user_id != session.target_user_id {
            return Err(SignalError::NotFound("call"));
        }
        let counterpart = session.counterpart_of(acting_user_id);
        if target_user_id != counterpart {
            return Err(SignalError::Validation(
                "target_user_id is not the call counterpart",
            ));
        }

        // Resolve against the status actually read. A lost swap means a
        // competing transition landed first; re-read and re-derive from the
        // winner's row (a decline that loses to an accept becomes an end).
        while !session.status.is_terminal() {
            let resolved = session.resolved_with(reason);
            if self
                .store
                .swap_status(call_id, &[session.status], &resolved)
                .await?
            {
                self.store.remove_expiry(call_id).await?;
                debug!(call = %call_id, reason = %reason, "call resolved");
                break;
            }
            session = self
                .store
                .get_session(call_id)
                .await?
                .ok_or(SignalError::NotFound("call"))?;
        }

        let event = SignalingEvent::CallEnded {
            call_id: call_id.to_string(),
            reason,
            ended_by_user_id: acting_user_id,
            target_user_id: counterpart,
            timestamp: Utc::now(),
        };
        let bytes = payload::encode(&event)?;
        let delivered = self.deliver_best_effort(counterpart, &bytes).await;

        info!(
            call = %call_id,
            ended_by = %acting_user_id,
            target = %counterpart,
            reason = %reason,
            delivered,
            "call end dispatched"
        );
        Ok(delivered)
    }

    /// Transition every pending/accepted session past its deadline to
    /// `expired`. Safe to run concurrently and repeatedly: each session is
    /// guarded by the status compare-and-swap.
    pub async fn sweep_expired(&self) -> Result<u64, SignalError> {
        let now = Utc::now();
        let candidates = self.store.expired_candidates(now).await?;
        let mut transitioned = 0u64;

        for call_id in candidates {
            loop {
                match self.store.get_session(&call_id).await? {
                    Some(session) if !session.status.is_terminal() => {
                        if self
                            .store
                            .swap_status(&call_id, &[session.status], &session.expired())
                            .await?
                        {
                            transitioned += 1;
                            debug!(call = %call_id, "session expired by sweep");
                            self.store.remove_expiry(&call_id).await?;
                            break;
                        }
                        // Lost to a competing transition; re-read and retry
                        // against the winner's row.
                    }
                    _ => {
                        // Already terminal (or row deleted by retention).
                        self.store.remove_expiry(&call_id).await?;
                        break;
                    }
                }
            }
        }

        if transitioned > 0 {
            info!(count = transitioned, "expired call sessions swept");
        }
        Ok(transitioned)
    }

    /// Delivery failures degrade to a boolean; a push-provider outage must
    /// never fail the signaling request itself.
    async fn deliver_best_effort(&self, user_id: i64, bytes: &[u8]) -> bool {
        match self.fanout.deliver(user_id, bytes).await {
            Ok(report) => report.delivered(),
            Err(e) => {
                error!(user = %user_id, "push fan-out error: {e}");
                false
            }
        }
    }
}
