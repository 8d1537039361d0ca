//! Worker plane: controller, handler registry, dispatch loops, host
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerHost                            │
//! │  ┌──────────────┐  ┌──────────────────────────────────────┐ │
//! │  │  Heartbeat   │  │  DispatchLoop x capacity             │ │
//! │  │  (10s)       │  │  claim -> run -> ack/fail -> publish │ │
//! │  └──────┬───────┘  └──────────────┬───────────────────────┘ │
//! │         │                         │                          │
//! │         ▼                         ▼                          │
//! │  ┌──────────────────┐   ┌──────────────────┐                │
//! │  │ WorkerController │   │ HandlerRegistry  │                │
//! │  │ (pause/drain/    │   │ (name -> fn)     │                │
//! │  │  orphan sweep)   │   └──────────────────┘                │
//! │  └──────────────────┘                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod controller;
mod dispatch;
mod host;
mod registry;

pub use controller::{ControllerConfig, SweepReport, WorkerController};
pub use dispatch::{DispatchConfig, DispatchLoop};
pub use host::{WorkerHost, WorkerHostConfig};
pub use registry::{HandlerContext, HandlerFuture, HandlerRegistry, HandlerResult, TaskHandler};
