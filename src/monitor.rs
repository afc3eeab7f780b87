//! Background maintenance: probing, reclaiming, and replenishing.
//!
//! Everything here is best-effort and local. Failures are logged and
//! absorbed; callers of acquire and release never see them.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::conn::Connect;
use crate::pool::{Lifecycle, PoolCore};

/// Spawn the maintenance task for a pool.
///
/// The task holds only a weak reference to the pool state: it exits when
/// the pool is dropped or leaves the running state.
pub(crate) fn spawn<M: Connect>(
    core: Weak<Mutex<PoolCore<M>>>,
    connector: Arc<M>,
    config: Config,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(strong) = core.upgrade() else {
                trace!("pool dropped, stopping health monitor");
                return;
            };
            if !pass(&strong, &core, &connector, &config).await {
                debug!("pool no longer running, stopping health monitor");
                return;
            }
        }
    });
}

/// One maintenance pass. Returns `false` once the pool stops running.
async fn pass<M: Connect>(
    core: &Arc<Mutex<PoolCore<M>>>,
    weak: &Weak<Mutex<PoolCore<M>>>,
    connector: &Arc<M>,
    config: &Config,
) -> bool {
    // Reclaim connections idle past their lifetime, then borrow the rest
    // for probing. Borrowed slots stay leased so the capacity cap holds
    // while they are out.
    let (expired, borrowed) = {
        let mut locked = core.lock();
        if locked.lifecycle() != Lifecycle::Running {
            return false;
        }
        (
            locked.reclaim_expired(config.idle_lifetime, config.min_size),
            locked.borrow_idle(),
        )
    };

    let reclaimed = expired.len();
    for slot in expired {
        connector.close(slot.into_conn());
    }
    if reclaimed > 0 {
        debug!(reclaimed, "closed connections idle past their lifetime");
    }

    for mut slot in borrowed {
        match connector.probe(slot.conn_mut()).await {
            Ok(()) => {
                let leftover = core.lock().restore(slot, true, weak, connector);
                if let Some(slot) = leftover {
                    connector.close(slot.into_conn());
                }
            }
            Err(error) => {
                warn!(
                    id = %slot.id(),
                    error = %error,
                    "evicting connection that failed its probe"
                );
                core.lock().evict(slot.id());
                connector.close(slot.into_conn());
            }
        }
    }

    // Replenish up to the minimum, handing fresh connections to parked
    // waiters first.
    loop {
        if !core.lock().reserve_replenish(config.min_size) {
            break;
        }
        match connector.connect().await {
            Ok(conn) => {
                let leftover = {
                    let mut locked = core.lock();
                    locked.finish_reservation();
                    let slot = locked.adopt(conn);
                    trace!(id = %slot.id(), "opened replacement connection");
                    locked.restore(slot, false, weak, connector)
                };
                if let Some(slot) = leftover {
                    connector.close(slot.into_conn());
                }
            }
            Err(error) => {
                warn!(error = %error, "replacement connection failed, retrying next pass");
                core.lock().abandon_reservation();
                break;
            }
        }
    }

    true
}
