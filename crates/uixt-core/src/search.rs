//! Swipe-search control loop.
//!
//! [`loop_until`] drives three caller-supplied steps: `find_action` (usually a
//! swipe), `find_condition` (usually a fresh screenshot plus a lookup) and
//! `found_action` (usually a tap). The condition is checked before the first
//! swipe, so a target that is already visible is acted on without scrolling.
//!
//! With `max_retry_times = N` the condition runs at most `N` times and the
//! find action at most `N - 1` times, with `interval` slept after each find
//! action. A condition failure that is not a not-found error aborts the loop.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info};

use crate::driver::{DriverError, Result};
use crate::options::ActionOptions;

/// Boxed future returned by the loop steps.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs the find/check/act loop.
///
/// Returns the value of `found_action`, or [`DriverError::LoopNotFound`] once
/// every check has failed.
pub async fn loop_until<'a, T, R, F, C, A>(
    opts: &ActionOptions,
    mut find_action: F,
    mut find_condition: C,
    found_action: A,
) -> Result<R>
where
    F: FnMut() -> BoxFuture<'a, Result<()>>,
    C: FnMut() -> BoxFuture<'a, Result<T>>,
    A: FnOnce(T) -> BoxFuture<'a, Result<R>>,
{
    let max_loops = opts.max_retry_times().max(1);
    let interval = opts.interval();

    for attempt in 1..=max_loops {
        match find_condition().await {
            Ok(found) => {
                info!(attempt, "search condition met");
                return found_action(found).await;
            }
            Err(e) if e.is_not_found() => {
                debug!(attempt, max_loops, error = %e, "search condition not met");
            }
            Err(e) => return Err(e),
        }

        if attempt == max_loops {
            break;
        }
        find_action().await?;
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    Err(DriverError::LoopNotFound { loops: max_loops })
}
