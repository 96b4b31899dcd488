use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::Result;
use futures_util::lock::Mutex;
use serde::Serialize;

use crate::core::{
    hash::HashMap,
    uri::Uri,
};

/// How a single call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The procedure produced a result.
    Success,
    /// The procedure failed.
    Error,
    /// The call was canceled by the caller.
    Canceled,
    /// The call ran past its timeout.
    TimedOut,
}

/// Counters for a single procedure.
#[derive(Debug, Default)]
pub struct ProcedureStatistics {
    calls: AtomicU64,
    errors: AtomicU64,
    cancels: AtomicU64,
    timeouts: AtomicU64,
    total_duration_micros: AtomicU64,
}

impl ProcedureStatistics {
    /// Records a finished call.
    pub fn record(&self, outcome: CallOutcome, duration: Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        let counter = match outcome {
            CallOutcome::Success => return,
            CallOutcome::Error => &self.errors,
            CallOutcome::Canceled => &self.cancels,
            CallOutcome::TimedOut => &self.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of the counters.
    pub fn snapshot(&self) -> ProcedureStatisticsSnapshot {
        ProcedureStatisticsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_duration_micros: self.total_duration_micros.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`ProcedureStatistics`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProcedureStatisticsSnapshot {
    pub calls: u64,
    pub errors: u64,
    pub cancels: u64,
    pub timeouts: u64,
    pub total_duration_micros: u64,
}

/// A point-in-time copy of every counter in a [`StatisticsRegistry`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Counters per procedure.
    pub procedures: BTreeMap<String, ProcedureStatisticsSnapshot>,
    /// Invocations for unknown registrations, keyed by procedure name or registration ID.
    pub not_found: BTreeMap<String, u64>,
}

/// Read-only introspection into calls handled by a callee.
#[derive(Debug, Default)]
pub struct StatisticsRegistry {
    procedures: Mutex<HashMap<Uri, Arc<ProcedureStatistics>>>,
    not_found: Mutex<HashMap<String, u64>>,
}

impl StatisticsRegistry {
    /// The counters for a procedure, created on first use.
    pub async fn procedure(&self, procedure: &Uri) -> Arc<ProcedureStatistics> {
        self.procedures
            .lock()
            .await
            .entry(procedure.clone())
            .or_default()
            .clone()
    }

    /// Records an invocation for a registration that does not exist.
    pub async fn record_not_found(&self, key: &str) {
        *self
            .not_found
            .lock()
            .await
            .entry(key.to_owned())
            .or_default() += 1;
    }

    /// A point-in-time copy of every counter.
    pub async fn snapshot(&self) -> StatisticsSnapshot {
        let procedures = self
            .procedures
            .lock()
            .await
            .iter()
            .map(|(procedure, statistics)| (procedure.to_string(), statistics.snapshot()))
            .collect();
        let not_found = self
            .not_found
            .lock()
            .await
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect();
        StatisticsSnapshot {
            procedures,
            not_found,
        }
    }

    /// Dumps every counter as JSON.
    pub async fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot().await)?)
    }
}
