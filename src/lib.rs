//! # wiz_script_rs
//!
//! An async Rust library for scripting many Wiz smart lights at once.
//!
//! Messages are sent to every bulb in a [`Reference`] concurrently. Larger
//! scripts are built from [`Pipeline`]s, [`Repeater`]s and custom
//! [`Procedure`]s, which decide what to send next based on how earlier
//! batches went. Errors either go to an [`ErrorCatcher`] as they happen or are
//! raised together once the run is over.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wiz_script_rs::{Message, Pipeline, Reference, RunOptions, Target, TransportConfig, WizSession};
//!
//! async fn blink() -> Result<(), wiz_script_rs::Error> {
//!     let session = Arc::new(WizSession::new(TransportConfig::default()));
//!     let target = Target::new(session.clone());
//!
//!     let blink = Pipeline::new()
//!         .then([Message::set_state(false)])
//!         .then([Message::set_state(true)])
//!         .spread(Duration::from_secs(1));
//!
//!     let replies = target
//!         .script([blink])
//!         .run_all(Reference::All, RunOptions::default())
//!         .await?;
//!     println!("{} replies", replies.len());
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Runtime Agnostic**: Works with tokio, async-std, or smol async runtimes
//! - **References**: Address every bulb, a list of MACs, or a custom [`SpecialReference`]
//! - **Batches**: Adjacent messages are sent together as a [`MessageBatch`]
//! - **Pipelines**: Run batches in order, in lockstep or per bulb, with [`Pipeline`]
//! - **Loops**: Repeat a batch with a minimum loop time using [`Repeater`]
//! - **Procedures**: Write your own sequencing with [`FromGenerator`] and [`Procedure`]
//! - **Cancellation**: Dropping a reply stream stops the work behind it
//! - **Testing**: Run scripts against in-memory bulbs with [`fake::MemorySession`]
//!
//! ## Communication
//!
//! [`WizSession`] talks to bulbs over UDP on port 38899. Bulbs are found by
//! broadcasting a registration message, and unanswered messages are resent on
//! the [`RetryOptions`] schedule until they time out.
//!
//! ## Runtime Selection
//!
//! This library is runtime-agnostic. Select your preferred runtime using feature flags:
//!
//! ### Using tokio (default)
//!
//! ```toml
//! [dependencies]
//! wiz-script-rs = "0.1"
//! tokio = { version = "1", features = ["rt-multi-thread", "macros"] }
//! ```
//!
//! ### Using async-std
//!
//! ```toml
//! [dependencies]
//! wiz-script-rs = { version = "0.1", default-features = false, features = ["runtime-async-std"] }
//! async-std = { version = "1.12", features = ["attributes"] }
//! ```
//!
//! ### Using smol
//!
//! ```toml
//! [dependencies]
//! wiz-script-rs = { version = "0.1", default-features = false, features = ["runtime-smol"] }
//! smol = "2"
//! ```
//!
//! ## Feature Flags
//!
//! - `runtime-tokio` (default): Use the tokio async runtime
//! - `runtime-async-std`: Use the async-std runtime
//! - `runtime-smol`: Use the smol runtime

mod catcher;
mod config;
mod errors;
pub mod fake;
mod handle;
mod message;
mod queue;
mod reference;
pub mod runtime;
pub mod script;
mod session;
mod streamer;
mod supervisor;
mod transform;
mod wiz;

// Re-export public API
pub use catcher::ErrorCatcher;
pub use config::{RetryOptions, RetryTicker, TransportConfig};
pub use errors::Error;
pub use handle::{CancellableHandle, Completion, Done, LifetimeHandle, Outcome};
pub use message::{Message, Method, Reply, Serial};
pub use queue::AsyncQueue;
pub use reference::{FoundSerials, HardCodedSerials, Reference, SpecialReference, find_serials};
pub use script::{
    FromGenerator, LoopHook, MessageBatch, Pipeline, Procedure, ProcedureArgs, ReferenceOverride,
    Repeater, ReplyStream, Runnable, ScriptPart, ScriptRunner, Simplifiable, Step, Target,
    simplify,
};
pub use session::{RunOptions, SendLimit, Session};
pub use streamer::{Producers, StreamItem, StreamMerger};
pub use supervisor::{RunningTask, TaskSupervisor};
pub use transform::PowerToggle;
pub use wiz::WizSession;
