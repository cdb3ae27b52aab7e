//! Stdio protocol plumbing shared by the qalam clients.
//!
//! A client is assembled from four pieces that never know about each other:
//!
//! ```text
//! ProcessSupervisor ──bytes──> Decoder ──frames──> Correlator (responses)
//!        ^                                   └──> EventBus   (everything else)
//!        └────────────── encoded requests ───────────────────────────┘
//! ```
//!
//! [`process`] owns the child, [`codec`] turns byte chunks into frames,
//! [`correlator`] pairs responses with waiting callers, and [`events`]
//! fans unsolicited messages out to subscribers. [`session`] tracks the
//! lifecycle every protocol façade shares.

pub mod codec;
pub mod correlator;
pub mod events;
pub mod process;
pub mod session;

mod error;

pub use codec::length::{LengthPrefixedDecoder, encode_frame};
pub use codec::prompt::{EvalOutcome, PromptDecoder, PromptSyntax};
pub use correlator::{Correlator, PendingResponse, RequestId};
pub use error::{FrameError, ProcessError, RpcError};
pub use events::{BusEvent, EventBus, Subscription};
pub use process::{ProcessEvent, ProcessEvents, ProcessSpec, ProcessSupervisor};
pub use session::{SessionCell, SessionState, StopReason};

#[cfg(feature = "test-support")]
pub use process::RemoteEnd;
