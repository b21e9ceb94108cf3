//! Call types and data structures

use crate::identity::{IdentityError, UserId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Separator joining the two participants of a call id
pub const PAIR_SEPARATOR: char = '_';

/// Separator between the participant pair and the attempt stamp
pub const ATTEMPT_SEPARATOR: char = ':';

static LAST_ATTEMPT: AtomicU64 = AtomicU64::new(0);

/// Millisecond stamp that never repeats or goes backwards within a process
fn next_attempt_stamp() -> u64 {
    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    let mut prev = LAST_ATTEMPT.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_ATTEMPT.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Call id parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallIdError {
    /// Missing pair separator
    #[error("Call id is missing the participant separator: {0}")]
    MissingSeparator(String),

    /// Invalid attempt stamp
    #[error("Invalid call attempt: {0}")]
    InvalidAttempt(String),

    /// Invalid participant
    #[error("Invalid participant: {0}")]
    InvalidParticipant(#[from] IdentityError),
}

/// Identifier of one call attempt between two users
///
/// The participant pair is sorted, so both sides derive the same id without
/// negotiating. An optional attempt stamp separates a redial from a record
/// left over by the previous attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallId {
    low: UserId,
    high: UserId,
    attempt: Option<u64>,
}

impl CallId {
    /// Deterministic id for a pair of users, independent of argument order
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.clone(),
            high: high.clone(),
            attempt: None,
        }
    }

    /// Id for a specific attempt between a pair of users
    pub fn with_attempt(a: &UserId, b: &UserId, attempt: u64) -> Self {
        Self {
            attempt: Some(attempt),
            ..Self::for_pair(a, b)
        }
    }

    /// Fresh attempt id, strictly newer than any attempt issued before in this process
    pub fn next_attempt(a: &UserId, b: &UserId) -> Self {
        Self::with_attempt(a, b, next_attempt_stamp())
    }

    /// Both participants, in canonical order
    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    /// Attempt stamp, if any
    pub fn attempt(&self) -> Option<u64> {
        self.attempt
    }

    /// Whether the user is one of the participants
    pub fn involves(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `user`
    pub fn other_party(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Pair part of the id, without the attempt stamp
    pub fn pair_key(&self) -> String {
        format!("{}{}{}", self.low, PAIR_SEPARATOR, self.high)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attempt {
            Some(attempt) => write!(f, "{}{}{}", self.pair_key(), ATTEMPT_SEPARATOR, attempt),
            None => write!(f, "{}", self.pair_key()),
        }
    }
}

impl FromStr for CallId {
    type Err = CallIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pair, attempt) = match s.split_once(ATTEMPT_SEPARATOR) {
            Some((pair, attempt)) => {
                let attempt = attempt
                    .parse::<u64>()
                    .map_err(|_| CallIdError::InvalidAttempt(attempt.to_string()))?;
                (pair, Some(attempt))
            }
            None => (s, None),
        };
        let (a, b) = pair
            .split_once(PAIR_SEPARATOR)
            .ok_or_else(|| CallIdError::MissingSeparator(s.to_string()))?;
        let a = UserId::new(a)?;
        let b = UserId::new(b)?;
        Ok(Self {
            attempt,
            ..Self::for_pair(&a, &b)
        })
    }
}

impl TryFrom<String> for CallId {
    type Error = CallIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CallId> for String {
    fn from(id: CallId) -> Self {
        id.to_string()
    }
}

/// Requested media for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Camera and microphone
    Video,
    /// Microphone only
    Voice,
}

impl MediaKind {
    /// Whether the call asks for a camera
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Voice => write!(f, "voice"),
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "voice" => Ok(Self::Voice),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// Camera facing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    #[default]
    User,
    /// Rear camera
    Environment,
}

impl FacingMode {
    /// The other camera
    pub fn opposite(&self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description as produced and consumed by the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP text
    pub sdp: String,
    /// SDP type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

/// Offer field of a call record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    /// SDP offer text
    pub sdp: String,
    /// Always `offer`
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Who placed the call
    pub caller_id: UserId,
    /// Requested media
    pub media_kind: MediaKind,
}

impl OfferPayload {
    /// Build the payload from a local offer
    pub fn new(sdp: impl Into<String>, caller_id: UserId, media_kind: MediaKind) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
            caller_id,
            media_kind,
        }
    }

    /// Description to apply on the answering side
    pub fn description(&self) -> SessionDescription {
        SessionDescription::offer(self.sdp.clone())
    }
}

/// Answer field of a call record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    /// SDP answer text
    pub sdp: String,
    /// Always `answer`
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl AnswerPayload {
    /// Build the payload from a local answer
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }

    /// Description to apply on the offering side
    pub fn description(&self) -> SessionDescription {
        SessionDescription::answer(self.sdp.clone())
    }
}

/// ICE candidate, carried opaquely between the two peer connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Shared signaling document for one call attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Record key
    pub call_id: CallId,
    /// Written once by the caller
    pub offer: Option<OfferPayload>,
    /// Written once by the callee
    pub answer: Option<AnswerPayload>,
}

impl CallRecord {
    /// Fresh record holding only the offer
    pub fn offered(call_id: CallId, offer: OfferPayload) -> Self {
        Self {
            call_id,
            offer: Some(offer),
            answer: None,
        }
    }

    /// Who placed the call
    pub fn caller(&self) -> Option<&UserId> {
        self.offer.as_ref().map(|o| &o.caller_id)
    }

    /// Who is being called
    pub fn callee(&self) -> Option<&UserId> {
        self.caller().and_then(|caller| self.call_id.other_party(caller))
    }

    /// Unanswered record whose callee is `user`
    pub fn is_ringing_for(&self, user: &UserId) -> bool {
        self.answer.is_none() && self.callee() == Some(user)
    }
}

/// Which side of the offer/answer exchange a participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationRole {
    /// Writes the offer and `offerCandidates`
    Caller,
    /// Writes the answer and `answerCandidates`
    Callee,
}

impl NegotiationRole {
    /// The other side
    pub fn remote(&self) -> Self {
        match self {
            Self::Caller => Self::Callee,
            Self::Callee => Self::Caller,
        }
    }

    /// Name of the candidate sub-collection this role writes
    pub fn candidate_collection(&self) -> &'static str {
        match self {
            Self::Caller => "offerCandidates",
            Self::Callee => "answerCandidates",
        }
    }
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Callee => write!(f, "callee"),
        }
    }
}

/// Negotiation phase of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call
    #[default]
    Idle,
    /// Caller is acquiring media and writing the offer
    Initiating,
    /// Offer written, waiting for the callee
    AwaitingAnswer,
    /// Incoming call presented to the user
    Offered,
    /// Offer and answer both applied
    Answered,
    /// Media path established
    Connected,
    /// Torn down
    Ended,
}

impl CallPhase {
    /// Whether a session in this phase holds resources
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended)
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// This side hung up
    LocalHangup,
    /// This side declined the incoming call
    Rejected,
    /// The callee removed the call before answering
    RejectedByPeer,
    /// The other side removed the call
    EndedByPeer,
    /// Microphone (or camera, without fallback) access was refused
    PermissionDenied,
    /// Media devices failed for a reason other than permission
    MediaUnavailable,
    /// The peer connection failed
    ConnectionFailed,
    /// The peer connection dropped
    Disconnected,
    /// The offer or answer could not be written
    SignalingFailed,
    /// The call record vanished before it could be answered
    NoLongerAvailable,
    /// Both users dialed each other; this attempt gave way to the incoming one
    CallCollision,
}

impl EndReason {
    /// Text shown to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::LocalHangup => "Call ended.",
            Self::Rejected => "Call declined.",
            Self::RejectedByPeer => "The other user declined the call.",
            Self::EndedByPeer => "The other user has ended the call.",
            Self::PermissionDenied => {
                "Media access denied. Enable microphone and camera permissions in your browser settings."
            }
            Self::MediaUnavailable => "Camera or microphone is unavailable.",
            Self::ConnectionFailed => "The call connection failed.",
            Self::Disconnected => "The call connection was lost.",
            Self::SignalingFailed => "Could not reach the call service.",
            Self::NoLongerAvailable => "Call no longer available.",
            Self::CallCollision => "The other user is already calling you.",
        }
    }

    /// Whether the far side caused the end
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RejectedByPeer | Self::EndedByPeer)
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server urls (`stun:` or `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallEvent {
    /// Incoming call presented to the user
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: UserId,
        /// Requested media
        kind: MediaKind,
    },
    /// Negotiation phase changed
    PhaseChanged {
        /// Call identifier
        call_id: CallId,
        /// New phase
        phase: CallPhase,
    },
    /// Media path established
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// Call duration advanced
    DurationTick {
        /// Call identifier
        call_id: CallId,
        /// Seconds since connect
        seconds: u64,
    },
    /// Video call continues audio-only
    MediaDegraded {
        /// Call identifier
        call_id: CallId,
        /// Description
        reason: String,
    },
    /// Inbound track added to the remote stream
    RemoteTrackAdded {
        /// Call identifier
        call_id: CallId,
        /// Track id
        track_id: String,
    },
    /// A user control failed without ending the call
    ControlFailed {
        /// Call identifier
        call_id: CallId,
        /// Description
        message: String,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
}

/// Local media control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    /// Outgoing audio disabled
    pub muted: bool,
    /// Outgoing video enabled
    pub video_enabled: bool,
    /// Output routed to the loudspeaker
    pub speaker_on: bool,
    /// Active camera
    pub facing_mode: FacingMode,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            muted: false,
            video_enabled: false,
            speaker_on: false,
            facing_mode: FacingMode::User,
        }
    }
}

/// Snapshot of the current call, for the UI shell
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CallSnapshot {
    /// Current phase
    pub phase: CallPhase,
    /// Current or last call
    pub call_id: Option<CallId>,
    /// Role in the current call
    pub role: Option<NegotiationRole>,
    /// Other participant
    pub peer: Option<UserId>,
    /// Requested media
    pub kind: Option<MediaKind>,
    /// Whole seconds since connect
    pub duration_secs: u64,
    /// Control flags
    pub flags: MediaFlags,
    /// Camera was refused and the call continues audio-only
    pub video_denied: bool,
    /// Set once the call has ended
    pub end_reason: Option<EndReason>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn user(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    proptest! {
        #[test]
        fn prop_call_id_ignores_argument_order(
            a in "[a-zA-Z0-9.@-]{1,16}",
            b in "[a-zA-Z0-9.@-]{1,16}",
        ) {
            let (a, b) = (user(&a), user(&b));
            let forward = CallId::for_pair(&a, &b);
            prop_assert_eq!(&forward, &CallId::for_pair(&b, &a));
            prop_assert_eq!(forward.to_string().parse::<CallId>().unwrap(), forward);
        }
    }

    #[test]
    fn test_call_id_is_order_independent() {
        let a = user("A");
        let b = user("B");
        assert_eq!(CallId::for_pair(&a, &b), CallId::for_pair(&b, &a));
        assert_eq!(CallId::for_pair(&b, &a).to_string(), "A_B");
    }

    #[test]
    fn test_call_id_attempts_are_fresh() {
        let a = user("alice");
        let b = user("bob");
        let first = CallId::next_attempt(&a, &b);
        let second = CallId::next_attempt(&b, &a);
        assert_ne!(first, second);
        assert!(second.attempt().unwrap() > first.attempt().unwrap());
        assert_eq!(first.pair_key(), second.pair_key());
    }

    #[test]
    fn test_call_id_parse() {
        let id: CallId = "bob_alice:42".parse().unwrap();
        assert_eq!(id.to_string(), "alice_bob:42");
        assert_eq!(id.attempt(), Some(42));
        assert!(id.involves(&user("bob")));
        assert_eq!(id.other_party(&user("bob")), Some(&user("alice")));
        assert_eq!(id.other_party(&user("carol")), None);

        assert!(matches!(
            "alice".parse::<CallId>(),
            Err(CallIdError::MissingSeparator(_))
        ));
        assert!(matches!(
            "alice_bob:x".parse::<CallId>(),
            Err(CallIdError::InvalidAttempt(_))
        ));
    }

    #[test]
    fn test_offer_payload_wire_shape() {
        let offer = OfferPayload::new("v=0", user("A"), MediaKind::Video);
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sdp": "v=0",
                "type": "offer",
                "callerId": "A",
                "mediaKind": "video"
            })
        );
    }

    #[test]
    fn test_candidate_wire_shape() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_record_ringing_for() {
        let a = user("A");
        let b = user("B");
        let mut record = CallRecord::offered(
            CallId::for_pair(&a, &b),
            OfferPayload::new("v=0", a.clone(), MediaKind::Voice),
        );
        assert_eq!(record.caller(), Some(&a));
        assert_eq!(record.callee(), Some(&b));
        assert!(record.is_ringing_for(&b));
        assert!(!record.is_ringing_for(&a));

        record.answer = Some(AnswerPayload::new("v=0"));
        assert!(!record.is_ringing_for(&b));
    }

    #[test]
    fn test_end_reason_remote() {
        assert!(EndReason::EndedByPeer.is_remote());
        assert!(!EndReason::LocalHangup.is_remote());
        assert_eq!(
            EndReason::NoLongerAvailable.user_message(),
            "Call no longer available."
        );
    }
}
