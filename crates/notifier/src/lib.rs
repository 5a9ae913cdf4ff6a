//! Notification delivery worker.
//!
//! Consumes delivery jobs from the queue, routes each notification to the
//! sender for its channel, and settles the job according to the retry policy:
//!
//! - [`directory`]: recipient contact lookup
//! - [`transport`]: wire-level delivery (log, webhook)
//! - [`sender`]: per-channel senders and the type → sender registry
//! - [`policy`]: outcome → (state transition, ack decision)
//! - [`queue`]: job queue traits and the Redis Streams implementation
//! - [`worker`]: the job handler and consume loop

pub mod directory;
pub mod policy;
pub mod queue;
pub mod sender;
pub mod transport;
pub mod worker;
