use std::sync::Arc;

use crate::error::{FleetError, Result};
use crate::store::{CoordinationStore, Guard, Key, StoreOp, TenantId};

/// Per-tenant FIFO queues of pending resource paths.
///
/// Entries are not deduplicated: submitting the same path twice queues two
/// independent occurrences.
#[derive(Debug, Clone)]
pub struct TenantQueues {
    store: Arc<dyn CoordinationStore>,
}

impl TenantQueues {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Append to the tail and mark the tenant active.
    pub async fn enqueue(&self, tenant: &TenantId, resource_path: &str) -> Result<()> {
        self.push(tenant, resource_path, false).await
    }

    /// Reinsert at the head, ahead of fresh submissions.
    pub async fn enqueue_front(&self, tenant: &TenantId, resource_path: &str) -> Result<()> {
        self.push(tenant, resource_path, true).await
    }

    async fn push(&self, tenant: &TenantId, resource_path: &str, front: bool) -> Result<()> {
        let list = Key::Queue(tenant.clone());
        let value = resource_path.to_string();
        let push = if front {
            StoreOp::PushFront { list, value }
        } else {
            StoreOp::PushBack { list, value }
        };
        self.store
            .atomic(None, vec![push, Self::activate(tenant), Self::remember(tenant)])
            .await?;
        tracing::debug!(tenant = %tenant, resource_path, front, "Task enqueued");
        Ok(())
    }

    pub(crate) fn activate(tenant: &TenantId) -> StoreOp {
        StoreOp::SetAdd {
            set: Key::ActiveTenants,
            member: tenant.to_string(),
        }
    }

    pub(crate) fn remember(tenant: &TenantId) -> StoreOp {
        StoreOp::SetAdd {
            set: Key::KnownTenants,
            member: tenant.to_string(),
        }
    }

    /// Pop the head of the tenant's queue.
    pub async fn dequeue(&self, tenant: &TenantId) -> Result<Option<String>> {
        self.store.list_pop_front(&Key::Queue(tenant.clone())).await
    }

    /// Remove every queued occurrence of `resource_path`.
    pub async fn remove(&self, tenant: &TenantId, resource_path: &str) -> Result<usize> {
        let removed = self
            .store
            .list_remove(&Key::Queue(tenant.clone()), resource_path)
            .await?;
        if removed == 0 {
            return Err(FleetError::TaskNotFound {
                tenant: tenant.to_string(),
                resource_path: resource_path.to_string(),
            });
        }
        tracing::info!(tenant = %tenant, resource_path, removed, "Removed queued task");
        Ok(removed)
    }

    pub async fn depth(&self, tenant: &TenantId) -> Result<usize> {
        self.store.list_len(&Key::Queue(tenant.clone())).await
    }

    pub async fn list(&self, tenant: &TenantId) -> Result<Vec<String>> {
        self.store.list_range(&Key::Queue(tenant.clone()), None).await
    }

    /// Tenants with queued work and their depths.
    ///
    /// Tenants found empty are dropped from the active set; the removal is
    /// guarded so a tenant that received work in the meantime stays active.
    pub async fn active_tenants(&self) -> Result<Vec<(TenantId, usize)>> {
        let mut active = Vec::new();
        for raw in self.store.set_members(&Key::ActiveTenants).await? {
            let tenant = match TenantId::new(raw.clone()) {
                Ok(tenant) => tenant,
                Err(e) => {
                    tracing::warn!(tenant = %raw, error = %e, "Dropping malformed active tenant");
                    self.store.set_remove(&Key::ActiveTenants, &raw).await?;
                    continue;
                }
            };
            let depth = self.depth(&tenant).await?;
            if depth > 0 {
                active.push((tenant, depth));
            } else {
                self.store
                    .atomic(
                        Some(Guard::ListEmpty {
                            list: Key::Queue(tenant.clone()),
                        }),
                        vec![StoreOp::SetRemove {
                            set: Key::ActiveTenants,
                            member: tenant.to_string(),
                        }],
                    )
                    .await?;
            }
        }
        Ok(active)
    }

    /// Every tenant that has ever submitted work and not been reset.
    pub async fn known_tenants(&self) -> Result<Vec<TenantId>> {
        Ok(self
            .store
            .set_members(&Key::KnownTenants)
            .await?
            .into_iter()
            .filter_map(|raw| TenantId::new(raw).ok())
            .collect())
    }
}
