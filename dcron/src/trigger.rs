use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::schedule::Schedule;

// Stand-in deadline for fire times too far out to represent as an Instant
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Maps wall-clock fire times onto the monotonic clock.
#[derive(Clone, Copy)]
struct Anchor {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl Anchor {
    fn now() -> Self {
        Self {
            wall: Utc::now(),
            instant: Instant::now(),
        }
    }

    fn wall_now(&self) -> DateTime<Utc> {
        let elapsed = chrono::TimeDelta::from_std(self.instant.elapsed()).unwrap_or_default();
        self.wall + elapsed
    }

    fn deadline(&self, at: DateTime<Utc>) -> Instant {
        let offset = (at - self.wall).to_std().unwrap_or_default();
        self.instant
            .checked_add(offset)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
    }
}

/// Call `fire` at each fire time of `schedule` until `cancel` fires or the
/// schedule runs out.
///
/// Fire times already in the past when the loop gets to them are skipped.
pub(crate) async fn run_trigger<F>(
    schedule: Arc<dyn Schedule>,
    cancel: CancellationToken,
    mut fire: F,
) where
    F: FnMut(DateTime<Utc>),
{
    let anchor = Anchor::now();
    let mut after = anchor.wall;
    loop {
        let mut next = schedule.next_after(after);
        let now = anchor.wall_now();
        if next.is_some_and(|next| next < now) {
            debug!("skipping fire times missed while the loop was held up");
            next = schedule.next_after(now);
        }
        let Some(next) = next else {
            debug!("schedule has no further fire times");
            return;
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(anchor.deadline(next)) => {}
        }
        fire(next);
        after = next;
    }
}
