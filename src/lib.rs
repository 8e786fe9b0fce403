//! # Bhangmeter station library
//!
//! Captures the onset of an active-low detector pulse, tells genuine Nuclear Event
//! Detections (NED) apart from Built-In Self Test (BIST) stimulus, and durably
//! delivers exactly one record per detection to a remote JSON document over an
//! unreliable link.
//!
//! ## Crate Structure
//!
//! - **`signal`**: interrupt-context edge capture, debounce, and the lock-free handoff
//!   to the task side.
//! - **`classifier`**: turns edges into NED events (persisted) or self-test passes
//!   (local status only), giving detector edges priority.
//! - **`queue`**: the durable outbox. Sole owner of the sequence counter and of all
//!   persisted state.
//! - **`upload`**: drains the queue into the remote store with retry, backoff and
//!   idempotent commits.
//! - **`remote`**: the `RemoteStore` seam, the GitHub contents client, and an in-memory
//!   store.
//! - **`connectivity`**: link readiness.
//! - **`status`** / **`health`**: local indicators, counters, fault history.
//! - **`clock`** / **`sntp`**: wrap-safe ticks and wall-clock correction.
//! - **`heartbeat`**: periodic "still monitoring" updates of the station document.
//! - **`station`**: wiring and task lifecycle.
//! - **`config`**, **`error`**, **`tracing_setup`**: ambient plumbing.

pub mod classifier;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod health;
pub mod heartbeat;
pub mod queue;
pub mod remote;
pub mod signal;
pub mod sntp;
pub mod station;
pub mod status;
pub mod tracing_setup;
pub mod upload;

pub use error::{AppResult, BhangError};
