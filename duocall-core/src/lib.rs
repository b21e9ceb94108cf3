//! Duocall - one-to-one audio/video call negotiation
//!
//! This library sets up peer-to-peer calls between two users over a shared
//! document store used as the signaling channel. It features:
//!
//! - **Document Signaling**: One call record per call, keyed by the sorted user pair
//! - **Trickle ICE**: Candidates exchanged through per-role collections and buffered
//!   until the remote description is applied
//! - **Call Lifecycle**: Start, accept, reject, hang up and remote termination with
//!   guaranteed release of devices, connections and subscriptions
//! - **In-call Controls**: Mute, camera, loudspeaker and camera switching
//! - **Pluggable Runtime**: webrtc-rs backend or a fully in-process simulation
//!
//! # Examples
//!
//! ```rust,no_run
//! use duocall_core::prelude::*;
//! use duocall_core::sim::{SimMediaDevices, SimNetwork};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), CallError> {
//! let store = Arc::new(MemorySignalingStore::new());
//! let network = SimNetwork::new();
//!
//! let manager = CallManager::builder(UserId::new("alice")?, store)
//!     .with_media_devices(Arc::new(SimMediaDevices::new()))
//!     .with_peer_factory(Arc::new(network.factory("alice")))
//!     .build()?;
//! manager.start().await?;
//!
//! let call_id = manager.start_call(&UserId::new("bob")?, MediaKind::Video).await?;
//! println!("calling: {call_id}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and wire payloads
pub mod types;

/// User identity
pub mod identity;

/// Media and connection runtime contract
pub mod runtime;

/// Local and remote media for one call
pub mod media;

/// Signaling channel and handler
pub mod signaling;

/// In-memory signaling store
pub mod memory;

/// Offer/answer negotiation state machine
pub mod negotiation;

/// Call lifecycle management
pub mod call;

/// Simulated media and peer connections
pub mod sim;

/// webrtc-rs backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

// Re-export main types at crate root
pub use call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig};
pub use identity::{IdentityError, UserId};
pub use media::{LocalMedia, MediaError, MediaSession};
pub use memory::MemorySignalingStore;
pub use negotiation::CandidateBuffer;
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcPeerConnectionFactory, SampleMediaDevices, SampleTrack};
pub use runtime::{
    CaptureRequest, MediaDevices, MediaStream, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent, TrackHandle, TrackKind,
    TrackState,
};
pub use signaling::{RecordEvent, SignalingChannel, SignalingError, SignalingHandler, Subscription};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig};
    pub use crate::identity::UserId;
    pub use crate::memory::MemorySignalingStore;
    pub use crate::runtime::{MediaDevices, MediaStream, PeerConnectionFactory};
    pub use crate::signaling::{SignalingChannel, SignalingHandler};
    pub use crate::types::{
        CallEvent, CallId, CallPhase, CallSnapshot, EndReason, FacingMode, MediaKind,
        NegotiationRole,
    };
}
