//! Transports that drive the pipelines from the packet side.
//!
//! The pipelines never talk to a NIC themselves. A transport calls
//! `next_frame`/`frame_done` on the transmit side and `frame_ready` on the
//! receive side, and feeds per-packet arrivals to the timing parser.
//!
//! - **Loopback** ([`loopback`]): an in-process transport. A thread paces
//!   a TX pipeline at the frame rate, and synthetic packet traces are
//!   replayed through the compliance engine into an RX pipeline.

pub mod loopback;

pub use loopback::{LoopbackConfig, LoopbackRx, LoopbackSummary, LoopbackTx, PacketArrival, PacketTrace};
