// This file is part of boardctl, a control-plane library for FPGA-based signal-processing boards.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// boardctl is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// boardctl is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Fleet-wide operations: apply one board operation to many boards at once.
//!
//! Boards are independent, so the fan-out is embarrassingly parallel: every
//! board gets its own channel and its own blocking worker, with its own
//! timeout and retry budgets. One board failing or hanging never blocks its
//! siblings. Results land in a per-host outcome map; boards that miss the
//! bounded join deadline are reported as [`DeviceOutcome::Unresponsive`] and
//! may be given a bounded number of whole-batch retries.
//!
//! Workers that miss the deadline are abandoned, not cancelled (blocking
//! socket I/O cannot be interrupted mid-exchange), so their sessions die
//! with their sockets when the task eventually returns.

use crate::config::ChannelConfig;
use crate::error::BoardctlError;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};

/// The result of one board's share of a fleet operation.
#[derive(Debug)]
pub enum DeviceOutcome<T> {
    /// The operation completed on this board.
    Ok(T),
    /// The operation ran and failed on this board.
    Failed(BoardctlError),
    /// The board's worker missed the join deadline (and any batch retries).
    Unresponsive,
}

/// Knobs for one fleet fan-out.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// How long to wait for all workers of one batch before reporting the
    /// stragglers unresponsive.
    pub join_timeout: Duration,
    /// How many whole-batch retries the unresponsive set gets. Boards whose
    /// operation ran and failed are not retried.
    pub batch_retries: u32,
}

impl Default for FleetOptions {
    fn default() -> Self {
        FleetOptions {
            join_timeout: Duration::from_secs(120),
            batch_retries: 1,
        }
    }
}

/// Run `op` once per board, concurrently, and collect a per-host outcome map.
///
/// Each board's worker runs on the blocking thread pool with a channel of its
/// own; no state is shared between boards beyond the read-only `op`.
///
/// # Returns: `HashMap<String, DeviceOutcome<T>>`
/// * One entry per distinct host in `boards`
pub async fn run_on_fleet<T, F>(
    boards: Vec<ChannelConfig>,
    options: FleetOptions,
    op: F,
) -> HashMap<String, DeviceOutcome<T>>
where
    T: Send + 'static,
    F: Fn(ChannelConfig) -> Result<T, BoardctlError> + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let mut outcomes: HashMap<String, DeviceOutcome<T>> = HashMap::new();
    let mut pending: Vec<ChannelConfig> = boards;

    for batch in 0..=options.batch_retries {
        if pending.is_empty() {
            break;
        }
        if batch > 0 {
            info!(
                "retrying {} unresponsive boards (batch retry {batch}/{})",
                pending.len(),
                options.batch_retries
            );
        }

        let mut in_flight: HashMap<String, ChannelConfig> = pending
            .drain(..)
            .map(|config| (config.host.clone(), config))
            .collect();
        let mut join_set = JoinSet::new();
        for (host, config) in &in_flight {
            let op = Arc::clone(&op);
            let host = host.clone();
            let config = config.clone();
            join_set.spawn_blocking(move || (host, op(config)));
        }

        let deadline = Instant::now() + options.join_timeout;
        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((host, result)))) => {
                    in_flight.remove(&host);
                    let outcome = match result {
                        Ok(value) => DeviceOutcome::Ok(value),
                        Err(e) => {
                            warn!("fleet operation failed on {host}: {e}");
                            DeviceOutcome::Failed(e)
                        }
                    };
                    outcomes.insert(host, outcome);
                }
                Ok(Some(Err(e))) => {
                    // worker panicked; its host stays in_flight and is
                    // reported unresponsive below
                    error!("fleet worker died: {e}");
                }
                Err(_) => {
                    warn!(
                        "join deadline of {:?} passed with {} boards still running",
                        options.join_timeout,
                        join_set.len()
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }

        for (host, config) in in_flight {
            outcomes.insert(host, DeviceOutcome::Unresponsive);
            pending.push(config);
        }
    }

    outcomes
}
