//! Read-only projection of the scheduler tables for monitoring.
//!
//! The reported shape keeps fields that are no longer tracked (`start_ts`,
//! `boundary_ts`); they are always zero.

use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;

use crate::model::{CaptureId, KeySpanId, Ts};
use crate::scheduler::dispatcher::ScheduleDispatcher;
use crate::scheduler::keyspan_set::KeySpanStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeySpanReplicaInfo {
    /// Not tracked, always 0.
    pub start_ts: Ts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Dispatched,
    Processed,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySpanOperation {
    pub delete: bool,
    pub status: OperationStatus,
    /// Not tracked, always 0.
    pub boundary_ts: Ts,
}

/// Keyspans held by one capture plus the operations in flight on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub keyspans: BTreeMap<KeySpanId, KeySpanReplicaInfo>,
    pub operation: BTreeMap<KeySpanId, KeySpanOperation>,
}

/// Last reported progress of one capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskPosition {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
}

/// Internal scheduler state exposed to an API layer.
pub trait InfoProvider: Send + Sync {
    fn task_statuses(&self) -> impl Future<Output = BTreeMap<CaptureId, TaskStatus>> + Send;

    fn task_positions(&self) -> impl Future<Output = BTreeMap<CaptureId, TaskPosition>> + Send;
}

impl InfoProvider for ScheduleDispatcher {
    async fn task_statuses(&self) -> BTreeMap<CaptureId, TaskStatus> {
        let state = self.state.lock().await;
        let mut ret = BTreeMap::new();
        for (capture, keyspans) in state.keyspans.group_by_capture() {
            let mut status = TaskStatus::default();
            for (id, record) in keyspans {
                status.keyspans.insert(id, KeySpanReplicaInfo::default());
                let delete = match record.status {
                    KeySpanStatus::Running => continue,
                    KeySpanStatus::Adding => false,
                    KeySpanStatus::Removing => true,
                };
                status.operation.insert(
                    id,
                    KeySpanOperation {
                        delete,
                        status: OperationStatus::Dispatched,
                        boundary_ts: 0,
                    },
                );
            }
            ret.insert(capture, status);
        }
        ret
    }

    async fn task_positions(&self) -> BTreeMap<CaptureId, TaskPosition> {
        let state = self.state.lock().await;
        state
            .captures
            .iter()
            .map(|(capture, status)| {
                let position = status
                    .watermark
                    .map(|w| TaskPosition {
                        checkpoint_ts: w.checkpoint_ts(),
                        resolved_ts: w.resolved_ts(),
                    })
                    .unwrap_or_default();
                (capture.clone(), position)
            })
            .collect()
    }
}
