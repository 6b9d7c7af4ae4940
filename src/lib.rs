#![deny(unused, dead_code)]
#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some lifecycle functions are inherently long
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional around offsets and partition indexes
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

//! Sideline - streaming source for partitioned logs with operator-driven
//! record diversion and bounded replay.
//!
//! A running stream owns one unbounded *firehose* source reading the live
//! topic plus any number of bounded *replay* sources. Attaching a filter to
//! the firehose diverts matching records away from the output while the
//! active offset range is recorded durably; detaching the filter spawns a
//! replay source that re-reads exactly that range with the negated filter,
//! so every record is eventually delivered.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::registry` - String-keyed constructors for pluggable parts
//! - `core::time` - Deterministic time utilities
//!
//! ## Log
//! - `log` - Topic/partition/offset value types
//! - `log::client` - Broker client boundary and in-memory broker
//! - `log::consumer` - Partition claims, commit floors, offset flushing
//! - `log::deserializer` - Raw record decoding
//!
//! ## Messaging
//! - `messaging::filter` - Filter steps and copy-on-write filter chains
//! - `messaging::retry` - Failed-message retry policies
//! - `messaging::buffer` - Bounded fair buffers feeding the output
//!
//! ## Sideline
//! - `sideline::virtual_source` - The per-source consume/filter/track loop
//! - `sideline::coordinator` - Workers, ack/fail routing, shutdown
//! - `sideline::controller` - Start/stop/resume of sideline requests
//! - `sideline::factory` - Source construction from config
//!
//! ## Storage
//! - `storage` - Durable consumer offsets and sideline requests
//!
//! ## Operations
//! - `ops::metrics` - Metrics sink boundary

// Core infrastructure
pub mod core;

// Log access
pub mod log;

// Message plumbing
pub mod messaging;

// Sideline machinery
pub mod sideline;

// Durable state
pub mod storage;

// Operations
pub mod ops;

// Host-facing surface
pub mod stream;

// Re-exports for convenience
pub use self::core::config::{SidelineConfig, TaskContext};
pub use self::core::registry::ComponentRegistry;
pub use self::core::time::{Clock, ManualClock, SystemClock};
pub use log::{LogRecord, OffsetMap, TopicPartition};
pub use messaging::filter::{FilterChain, FilterStep, SharedFilterChain, ValuePattern};
pub use messaging::{Message, MessageId, SourceId};
pub use sideline::controller::{SidelineHandle, SidelineOps, SidelineTrigger};
pub use sideline::virtual_source::{SourceError, SourceState, VirtualSource};
pub use sideline::{SidelineId, SidelinePayload, SidelineRequest, SidelineType};
pub use storage::{PersistenceAdapter, PersistenceError, SidelineRequestRecord};
pub use stream::{SidelineStream, DEFAULT_STREAM_ID};
