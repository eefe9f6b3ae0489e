//! Continuously polls a data source and writes every fetched record into a
//! fixed set of sharded PostgreSQL tables.
//!
//! ```text
//!                     ┌──────────────┐
//!                     │ SourceAdapter│
//!                     └──────┬───────┘
//!                            │ fetch_batch
//!                     ┌──────▼───────┐       stop
//!                     │    Poller    │◄────────────── CancellationToken
//!                     └──────┬───────┘
//!                            │ Batch (Arc<[Record]>)
//!                     ┌──────▼───────┐
//!                     │  Dispatcher  │
//!                     └─┬─────┬────┬─┘
//!          own queue    │     │    │  one queue per (shard, table)
//!               ┌───────▼┐ ┌──▼───┐ ┌▼───────┐
//!               │ worker │ │worker│ │ worker │   one transaction per record
//!               └───┬────┘ └──┬───┘ └───┬────┘
//!                   └─────────┼─────────┘
//!                      ┌──────▼──────┐
//!                      │ ShardStore  │◄──── health checks
//!                      └─────────────┘
//! ```
//!
//! [`pipeline::Pipeline::start`] wires everything together; the
//! `shardfeed` binary adds configuration loading and signal handling.

pub mod dispatch;
pub mod health;
pub mod logging;
pub mod pipeline;
pub mod poller;
pub mod source;
pub mod store;
pub mod topology;
pub mod worker;

#[cfg(test)]
mod test;

pub use pipeline::{Pipeline, PipelineError, PipelineHandle, PipelineReport};
pub use shardfeed_types::IngestConfig;
