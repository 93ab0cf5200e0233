//! Frame-exchange pipelines and ST 2110-21/-30 timing compliance.
//!
//! - [`pipeline`]: TX/RX frame slot state machines shared between an
//!   application and a packet transport.
//! - [`compliance`]: per-packet timing parsers that classify frames as
//!   narrow, wide or failed.
//! - [`registry`]: session factory with explicit indices and stats dump.
//! - [`transport`]: the in-process loopback transport.

pub mod compliance;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod transport;

pub use compliance::{
    AudioComplianceEngine, AudioGeometry, Classification, ComplianceCause, ComplianceEngine,
    ComplianceSlot, ComplianceStat, FrameTiming, VideoGeometry,
};
pub use error::{ConfigErrorKind, Result, St2110Error};
pub use pipeline::{
    FrameHandle, FrameObserver, FrameState, MediaKind, PipelineConfig, PipelineStats, RxFrame,
    RxPipeline, RxPipelineConfig, RxTransport, SelectPolicy, SessionId, TransmitFrame, TxPipeline,
};
pub use registry::{SessionRegistry, StatSource};
