//! Plumbing shared by the Jarvis hub and every protocol process: the envelope
//! format, identifiers, channels, request correlation, the process registry
//! and the worker runtime.

pub mod channel;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod handoff;
pub mod id;
pub mod registry;
pub mod router;
pub mod worker;

pub use channel::{ChannelEndpoint, Framing};
pub use correlator::Correlator;
pub use envelope::{Builtin, Envelope, Kind, address};
pub use error::{ProtocolError, Result};
pub use handoff::WorkerHandoff;
pub use registry::{InboundEvent, LifecycleConfig, Owner, ProcessRegistry, TerminatedWorker, WorkerSummary};
pub use router::{RouteHandler, Router};
pub use worker::{ProtocolHandler, WorkerContext};
