//! Task lifecycle state machine.
//!
//! ```text
//! Queued -> Processing -> Done
//!                      -> Errored -> Queued (once) -> Processing -> Done | Failed
//! ```
//!
//! Every transition out of `Processing` is a guarded atomic batch: it only
//! applies while the task's processing record is still the one written at
//! claim time. A worker whose task was reclaimed by the monitor therefore gets
//! [`Transition::Stale`] instead of clobbering the new owner's state.

use std::sync::Arc;

use crate::error::Result;
use crate::scheduler::queue::TenantQueues;
use crate::scheduler::task::{
    ClaimedTask, ProcessingRecord, TaskId, TaskState, Transition, MAX_AUTOMATIC_RETRIES,
};
use crate::store::{CoordinationStore, Guard, Key, StoreOp, TenantId, WorkerName};

#[derive(Debug, Clone)]
pub struct TaskLifecycle {
    store: Arc<dyn CoordinationStore>,
    queues: TenantQueues,
    max_retries: u32,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            queues: TenantQueues::new(store.clone()),
            store,
            max_retries: MAX_AUTOMATIC_RETRIES,
        }
    }

    pub fn queues(&self) -> &TenantQueues {
        &self.queues
    }

    /// Queue a freshly submitted task at the tail of its tenant's queue.
    pub async fn submit(&self, task: &TaskId) -> Result<()> {
        self.queues.enqueue(&task.tenant, &task.resource_path).await?;
        tracing::info!(tenant = %task.tenant, resource_path = %task.resource_path, "Task submitted");
        Ok(())
    }

    /// Pop the head of `tenant`'s queue and mark it processing by `worker`.
    ///
    /// Pop, processing-set insert and record write happen in one atomic step,
    /// together with clearing residue of an earlier attempt.
    pub async fn claim(
        &self,
        tenant: &TenantId,
        worker: &WorkerName,
    ) -> Result<Option<ClaimedTask>> {
        let record = ProcessingRecord::new(worker.clone());
        let encoded = record.encode()?;

        let t = tenant.clone();
        let value = encoded.clone();
        let popped = self
            .store
            .list_pop_front_then(
                &Key::Queue(tenant.clone()),
                Box::new(move |path| {
                    vec![
                        StoreOp::SetAdd {
                            set: Key::Processing(t.clone()),
                            member: path.to_string(),
                        },
                        StoreOp::HashSet {
                            hash: Key::ProcessingRecords(t.clone()),
                            field: path.to_string(),
                            value: value.clone(),
                        },
                        StoreOp::HashDelete {
                            hash: Key::Errors(t.clone()),
                            field: path.to_string(),
                        },
                        StoreOp::SetRemove {
                            set: Key::Done(t.clone()),
                            member: path.to_string(),
                        },
                    ]
                }),
            )
            .await?;

        Ok(popped.map(|resource_path| {
            tracing::info!(tenant = %tenant, resource_path = %resource_path, worker = %worker, "Task claimed");
            ClaimedTask {
                task: TaskId {
                    tenant: tenant.clone(),
                    resource_path,
                },
                record,
                encoded_record: encoded,
            }
        }))
    }

    fn owned_by(claimed: &ClaimedTask) -> Guard {
        Guard::HashFieldEquals {
            hash: Key::ProcessingRecords(claimed.task.tenant.clone()),
            field: claimed.task.resource_path.clone(),
            value: claimed.encoded_record.clone(),
        }
    }

    fn leave_processing(task: &TaskId) -> [StoreOp; 2] {
        [
            StoreOp::SetRemove {
                set: Key::Processing(task.tenant.clone()),
                member: task.resource_path.clone(),
            },
            StoreOp::HashDelete {
                hash: Key::ProcessingRecords(task.tenant.clone()),
                field: task.resource_path.clone(),
            },
        ]
    }

    /// Whether `claimed` is still the live claim on its task.
    pub async fn still_owns(&self, claimed: &ClaimedTask) -> Result<bool> {
        let current = self
            .store
            .hash_get(
                &Key::ProcessingRecords(claimed.task.tenant.clone()),
                &claimed.task.resource_path,
            )
            .await?;
        Ok(current.as_deref() == Some(claimed.encoded_record.as_str()))
    }

    /// Processing -> Done.
    pub async fn complete(&self, claimed: &ClaimedTask) -> Result<Transition> {
        let task = &claimed.task;
        let mut ops = Self::leave_processing(task).to_vec();
        ops.push(StoreOp::SetAdd {
            set: Key::Done(task.tenant.clone()),
            member: task.resource_path.clone(),
        });

        if self.store.atomic(Some(Self::owned_by(claimed)), ops).await? {
            tracing::info!(tenant = %task.tenant, resource_path = %task.resource_path, worker = %claimed.record.worker, "Task completed");
            Ok(Transition::Completed)
        } else {
            tracing::warn!(tenant = %task.tenant, resource_path = %task.resource_path, worker = %claimed.record.worker, "Completion of reclaimed task ignored");
            Ok(Transition::Stale)
        }
    }

    /// Processing -> Errored, then either back to Queued or terminally Failed.
    pub async fn fail(&self, claimed: &ClaimedTask, error: &str) -> Result<Transition> {
        let task = &claimed.task;
        let retries = self.retry_count(&task.tenant, &task.resource_path).await?;

        let mut ops = Self::leave_processing(task).to_vec();
        ops.push(StoreOp::HashSet {
            hash: Key::Errors(task.tenant.clone()),
            field: task.resource_path.clone(),
            value: error.to_string(),
        });

        let retry = retries < self.max_retries;
        if retry {
            ops.push(StoreOp::HashIncr {
                hash: Key::Retries(task.tenant.clone()),
                field: task.resource_path.clone(),
                by: 1,
            });
            ops.push(StoreOp::PushBack {
                list: Key::Queue(task.tenant.clone()),
                value: task.resource_path.clone(),
            });
            ops.push(TenantQueues::activate(&task.tenant));
        }

        if !self.store.atomic(Some(Self::owned_by(claimed)), ops).await? {
            tracing::warn!(tenant = %task.tenant, resource_path = %task.resource_path, worker = %claimed.record.worker, error, "Failure of reclaimed task ignored");
            return Ok(Transition::Stale);
        }

        if retry {
            let attempt = retries + 1;
            tracing::warn!(tenant = %task.tenant, resource_path = %task.resource_path, attempt, error, "Task failed, requeued for retry");
            Ok(Transition::Retried { attempt })
        } else {
            tracing::error!(tenant = %task.tenant, resource_path = %task.resource_path, error, "Task failed after retry");
            Ok(Transition::Failed)
        }
    }

    /// Return a processing task to the head of its queue without charging
    /// its retry budget. Only applies while `expected_record` is still the
    /// stored record, so repeating a reclaim is a no-op.
    pub async fn reclaim(
        &self,
        tenant: &TenantId,
        resource_path: &str,
        expected_record: &str,
    ) -> Result<bool> {
        let task = TaskId {
            tenant: tenant.clone(),
            resource_path: resource_path.to_string(),
        };
        let mut ops = Self::leave_processing(&task).to_vec();
        ops.push(StoreOp::PushFront {
            list: Key::Queue(tenant.clone()),
            value: resource_path.to_string(),
        });
        ops.push(TenantQueues::activate(tenant));

        let guard = Guard::HashFieldEquals {
            hash: Key::ProcessingRecords(tenant.clone()),
            field: resource_path.to_string(),
            value: expected_record.to_string(),
        };
        let reclaimed = self.store.atomic(Some(guard), ops).await?;
        if reclaimed {
            tracing::warn!(tenant = %tenant, resource_path, "Task reclaimed to queue head");
        }
        Ok(reclaimed)
    }

    /// Operator removal of a task that is still queued.
    pub async fn delete_queued(&self, tenant: &TenantId, resource_path: &str) -> Result<usize> {
        self.queues.remove(tenant, resource_path).await
    }

    pub async fn retry_count(&self, tenant: &TenantId, resource_path: &str) -> Result<u32> {
        Ok(self
            .store
            .hash_get(&Key::Retries(tenant.clone()), resource_path)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    /// Processing records of `tenant`, keyed by resource path, with the raw
    /// encoding needed to guard a reclaim.
    pub async fn in_flight(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<(String, ProcessingRecord, String)>> {
        let raw = self
            .store
            .hash_get_all(&Key::ProcessingRecords(tenant.clone()))
            .await?;
        let mut records = Vec::with_capacity(raw.len());
        for (path, encoded) in raw {
            match ProcessingRecord::decode(&encoded) {
                Ok(record) => records.push((path, record, encoded)),
                Err(e) => {
                    tracing::warn!(tenant = %tenant, resource_path = %path, error = %e, "Unreadable processing record");
                }
            }
        }
        Ok(records)
    }

    pub async fn state_of(&self, tenant: &TenantId, resource_path: &str) -> Result<TaskState> {
        if self
            .store
            .set_contains(&Key::Processing(tenant.clone()), resource_path)
            .await?
        {
            return Ok(TaskState::Processing);
        }
        if self
            .queues
            .list(tenant)
            .await?
            .iter()
            .any(|p| p == resource_path)
        {
            return Ok(TaskState::Queued);
        }
        if self
            .store
            .set_contains(&Key::Done(tenant.clone()), resource_path)
            .await?
        {
            return Ok(TaskState::Done);
        }
        let errored = self
            .store
            .hash_get(&Key::Errors(tenant.clone()), resource_path)
            .await?
            .is_some();
        if errored && self.retry_count(tenant, resource_path).await? >= self.max_retries {
            return Ok(TaskState::Failed);
        }
        Ok(TaskState::Unknown)
    }

    /// Administrative reset: drop every coordination key of `tenant`.
    pub async fn purge_tenant(&self, tenant: &TenantId) -> Result<()> {
        let mut ops: Vec<StoreOp> = Key::tenant_keys(tenant)
            .into_iter()
            .map(|key| StoreOp::Delete { key })
            .collect();
        ops.push(StoreOp::SetRemove {
            set: Key::ActiveTenants,
            member: tenant.to_string(),
        });
        ops.push(StoreOp::SetRemove {
            set: Key::KnownTenants,
            member: tenant.to_string(),
        });
        self.store.atomic(None, ops).await?;
        tracing::warn!(tenant = %tenant, "Tenant coordination state purged");
        Ok(())
    }
}
