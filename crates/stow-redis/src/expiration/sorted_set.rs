//! Poll-driven expiration.
//!
//! Every session of the namespace is a member of one sorted set, scored by
//! the epoch millisecond at which it expires. A periodic task reads the due
//! range and claims each entry with `zrem`; only the node whose `zrem`
//! removed the member deletes the session, so racing nodes never delete
//! twice.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stow_session::{Result, SessionData, TaskHandle, now_millis};
use tracing::{debug, info, warn};

use super::{ExpirationStrategy, StrategyContext};

/// Name of the periodic cleanup task.
pub const CLEANUP_TASK: &str = "sorted-set-session-cleanup";

/// Score of sessions that never expire.
pub const NEVER_EXPIRES_SCORE: f64 = f64::MAX;

const MIN_PERIOD: Duration = Duration::from_secs(1);
const MAX_PERIOD: Duration = Duration::from_secs(60);

/// Cleanup period for a given inactivity timeout: a third of it, between one
/// second and one minute.
pub fn cleanup_period(max_inactive_interval: i32) -> Duration {
    if max_inactive_interval <= 0 {
        return MAX_PERIOD;
    }
    Duration::from_secs((max_inactive_interval / 3) as u64).clamp(MIN_PERIOD, MAX_PERIOD)
}

fn score(session: &SessionData) -> f64 {
    session
        .expires_at()
        .map_or(NEVER_EXPIRES_SCORE, |at| at as f64)
}

/// Claim and delete every session due at `now`. Returns how many this node
/// claimed.
fn cleanup(ctx: &StrategyContext, index: &str, now: i64) -> Result<usize> {
    let due = ctx.store.zrange_by_score(index, 0.0, now as f64)?;
    let mut claimed = 0;

    for id in &due {
        if ctx.store.zrem(index, id)? == 0 {
            debug!(session_id = %id, "Expired session claimed by another node");
            continue;
        }
        claimed += 1;
        if let Err(e) = ctx.deleter.delete(id, true) {
            warn!(session_id = %id, error = %e, "Failed to delete expired session");
        }
    }

    if claimed > 0 {
        debug!(claimed, due = due.len(), "Expired sessions cleaned up");
    }
    Ok(claimed)
}

struct CleanupState {
    period: Duration,
    task: Option<TaskHandle>,
    closed: bool,
}

/// Expiration driven by periodic scans of a sorted index.
///
/// Cleanup passes never overlap, including a pass still running on a handle
/// that [`configuration_changed`](ExpirationStrategy::configuration_changed)
/// just cancelled.
pub struct SortedSetExpiration {
    ctx: StrategyContext,
    index: String,
    state: Mutex<CleanupState>,
    /// Held for the duration of every cleanup pass.
    pass: Arc<Mutex<()>>,
}

impl SortedSetExpiration {
    pub fn new(ctx: StrategyContext, max_inactive_interval: i32) -> Self {
        let index = ctx.keys.sorted_set_key();
        Self {
            ctx,
            index,
            state: Mutex::new(CleanupState {
                period: cleanup_period(max_inactive_interval),
                task: None,
                closed: false,
            }),
            pass: Arc::new(Mutex::new(())),
        }
    }

    /// Current cleanup period.
    pub fn period(&self) -> Duration {
        self.state.lock().period
    }

    /// Run one cleanup pass as of `now`.
    pub fn cleanup_expired(&self, now: i64) -> Result<usize> {
        let _pass = self.pass.lock();
        cleanup(&self.ctx, &self.index, now)
    }

    fn schedule(&self, period: Duration) -> TaskHandle {
        let ctx = self.ctx.clone();
        let index = self.index.clone();
        let pass = Arc::clone(&self.pass);
        self.ctx.scheduler.schedule_at_fixed_rate(
            CLEANUP_TASK,
            Arc::new(move || {
                let _pass = pass.lock();
                if let Err(e) = cleanup(&ctx, &index, now_millis()) {
                    warn!(error = %e, "Sorted-set cleanup failed");
                }
            }),
            period,
        )
    }
}

impl ExpirationStrategy for SortedSetExpiration {
    fn session_touched(&self, session: &SessionData) -> Result<()> {
        self.ctx
            .store
            .zadd(&self.index, session.id(), score(session))?;
        self.ctx.renew_session_ttl(session)
    }

    fn session_deleted(&self, session: &SessionData) -> Result<()> {
        self.ctx.store.zrem(&self.index, session.id())?;
        Ok(())
    }

    fn session_id_change(&self, session: &SessionData) -> Result<()> {
        let Some(new_id) = session.new_id() else {
            return Ok(());
        };
        self.ctx.store.zrem(&self.index, session.id())?;
        self.ctx.store.zadd(&self.index, new_id, score(session))?;
        Ok(())
    }

    fn start_expired_sessions_task(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.task.is_some() || state.closed {
            return Ok(());
        }
        state.task = Some(self.schedule(state.period));
        info!(period_secs = state.period.as_secs(), "Sorted-set expiration started");
        Ok(())
    }

    fn configuration_changed(&self, max_inactive_interval: i32) {
        let period = cleanup_period(max_inactive_interval);
        let mut state = self.state.lock();
        if state.period == period {
            return;
        }
        state.period = period;

        if let Some(old) = state.task.take() {
            old.cancel();
            state.task = Some(self.schedule(period));
            info!(period_secs = period.as_secs(), "Sorted-set cleanup rescheduled");
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(task) = state.task.take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_period() {
        assert_eq!(cleanup_period(1800), Duration::from_secs(60));
        assert_eq!(cleanup_period(90), Duration::from_secs(30));
        assert_eq!(cleanup_period(2), Duration::from_secs(1));
        assert_eq!(cleanup_period(0), Duration::from_secs(60));
        assert_eq!(cleanup_period(-1), Duration::from_secs(60));
    }

    #[test]
    fn test_score() {
        assert_eq!(score(&SessionData::restored("a", 0, 1_000, 10)), 11_000.0);
        assert_eq!(score(&SessionData::restored("a", 0, 1_000, 0)), NEVER_EXPIRES_SCORE);
    }
}
