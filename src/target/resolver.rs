//! Resolver for targets declared in configuration.
//!
//! Connections are opened on first use and cached per target, so a batch that
//! names the same target many times shares one pool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use super::{PostgresTarget, QueryTarget, TargetResolver};
use crate::config::{Config, ConnectionConfig};
use crate::error::{BatchError, Result};
use crate::query::TargetId;

struct TargetSlot {
    config: ConnectionConfig,
    target: OnceCell<Arc<PostgresTarget>>,
}

/// Resolves target ids to lazily connected Postgres targets.
pub struct ConfiguredResolver {
    slots: HashMap<TargetId, TargetSlot>,
    statements: Arc<HashMap<String, String>>,
    pool_size: u32,
}

impl ConfiguredResolver {
    /// Builds a resolver from the `[targets]` and `[query_types]` sections.
    pub fn from_config(config: &Config) -> Self {
        let slots = config
            .targets
            .iter()
            .map(|(name, conn)| {
                let mut conn = conn.clone();
                conn.apply_env_defaults();
                (
                    TargetId::new(name.clone()),
                    TargetSlot {
                        config: conn,
                        target: OnceCell::new(),
                    },
                )
            })
            .collect();

        let statements = config
            .query_types
            .iter()
            .filter_map(|(name, t)| t.statement.clone().map(|sql| (name.clone(), sql)))
            .collect();

        // One connection per worker, so no permit holder waits on the pool.
        let pool_size = u32::try_from(config.dispatch.workers).unwrap_or(u32::MAX);

        Self {
            slots,
            statements: Arc::new(statements),
            pool_size,
        }
    }

    /// Number of configured targets.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no targets are configured.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Closes every pool that has been opened.
    pub async fn close(&self) {
        for slot in self.slots.values() {
            if let Some(target) = slot.target.get() {
                target.close().await;
            }
        }
    }
}

#[async_trait]
impl TargetResolver for ConfiguredResolver {
    async fn resolve(&self, target_id: &TargetId) -> Result<Arc<dyn QueryTarget>> {
        let slot = self
            .slots
            .get(target_id)
            .ok_or_else(|| BatchError::target_not_found(target_id.as_str()))?;

        let target = slot
            .target
            .get_or_try_init(|| async {
                let target = PostgresTarget::connect(
                    target_id.as_str(),
                    &slot.config,
                    self.pool_size,
                    Arc::clone(&self.statements),
                )
                .await?;
                info!("Target {target_id} connected ({})", slot.config.display_string());
                Ok::<_, BatchError>(Arc::new(target))
            })
            .await?;

        Ok(Arc::clone(target) as Arc<dyn QueryTarget>)
    }
}
