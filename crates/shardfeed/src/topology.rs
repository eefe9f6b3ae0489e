//! Shard topology.
//!
//! The topology is the static mapping from shard names to the tables each
//! shard owns.  It is computed once at startup from the shard configuration
//! and the source's table prefix, materialized in the backing store, and
//! never changes afterwards.

use crate::store::ShardStore;
use shardfeed_types::ShardsConfig;
use tracing::{info, warn};

/// One shard and the tables it owns, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub name: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardTopology {
    shards: Vec<Shard>,
}

impl ShardTopology {
    /// Computes the topology without touching the store.
    ///
    /// Primary replicas are named `{prefix}{i}` and own one table named
    /// `table_prefix`.  Extra groups are named `{prefix}_{group}` and own
    /// `{table_prefix}_{j}` for every `j` up to the group's table count.
    pub fn plan(config: &ShardsConfig, table_prefix: &str) -> Self {
        let prefix = &config.prefix;
        let replicas = (1..=config.copies).map(|i| Shard {
            name: format!("{prefix}{i}"),
            tables: vec![table_prefix.to_string()],
        });
        let extra = config.extra.iter().map(|(group, settings)| Shard {
            name: format!("{prefix}_{group}"),
            tables: (1..=settings.tables)
                .map(|j| format!("{table_prefix}_{j}"))
                .collect(),
        });

        Self {
            shards: replicas.chain(extra).collect(),
        }
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shard_names(&self) -> Vec<&str> {
        self.shards.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn tables(&self, shard: &str) -> Option<&[String]> {
        self.shards
            .iter()
            .find(|s| s.name == shard)
            .map(|s| s.tables.as_slice())
    }

    /// Every `(shard, table)` pair; one worker is started per pair.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.shards.iter().flat_map(|shard| {
            shard
                .tables
                .iter()
                .map(move |table| (shard.name.as_str(), table.as_str()))
        })
    }
}

/// Materializes a [`ShardTopology`] in the backing store.
pub struct TopologyBuilder<'a> {
    store: &'a dyn ShardStore,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(store: &'a dyn ShardStore) -> Self {
        Self { store }
    }

    /// Plans the topology and creates every shard and table that does not
    /// exist yet.
    ///
    /// Creation failures are logged and skipped: the shard stays in the
    /// returned topology, and its workers will report failed writes until
    /// the table appears.
    pub async fn build(
        &self,
        config: &ShardsConfig,
        table_prefix: &str,
        schema: &str,
    ) -> ShardTopology {
        let topology = ShardTopology::plan(config, table_prefix);

        for shard in topology.shards() {
            if let Err(e) = self.store.ensure_shard(&shard.name).await {
                warn!("failed to create shard {}: {e}", shard.name);
            }
            for table in &shard.tables {
                if let Err(e) = self.store.ensure_table(&shard.name, table, schema).await {
                    warn!("failed to create table {table} in shard {}: {e}", shard.name);
                }
            }
        }

        info!(
            "topology ready: {} shards, {} tables",
            topology.shards().len(),
            topology.pairs().count()
        );
        topology
    }
}
