//! The control surface shared by single-topic and multi-topic consumers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::event::{ErrorHandler, Filter, IdleHandler, PhaseChangedHandler, PlaybackTimeHandler};
use crate::params::ConsumingParams;
use crate::phase::Phase;

/// A consumer with a start/pause/resume/stop lifecycle.
///
/// Handler setters replace the previous handler for the same slot. Event
/// handlers are typed and registered through the implementors' inherent
/// `set_event_handler`.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Unique id, `"{prefix}-{uuid}"`.
    fn id(&self) -> &str;

    fn phase(&self) -> Phase;

    /// Running or paused.
    fn is_running(&self) -> bool {
        self.phase().is_active()
    }

    /// Watch phase changes; drop the receiver to unsubscribe.
    fn subscribe(&self) -> watch::Receiver<Phase>;

    fn consuming_params(&self) -> ConsumingParams;

    /// Replace the consuming params. Must be called before [`Consumer::start`].
    fn set_consuming_params(&self, params: ConsumingParams) -> Result<()>;

    /// Begin consuming. Fails unless the consumer was never started.
    async fn start(&self) -> Result<()>;

    /// Stop consuming. Stopping a stopped consumer is a no-op.
    async fn stop(&self) -> Result<()>;

    /// Stop only when running or paused.
    async fn stop_if_running(&self) -> Result<()> {
        if self.is_running() {
            self.stop().await
        } else {
            Ok(())
        }
    }

    fn pause(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;

    /// Change the replay rate; must lie in `[RATE_MIN, RATE_MAX]`.
    fn change_rate(&self, rate: f64) -> Result<()>;

    fn set_phase_changed_handler(&self, handler: PhaseChangedHandler);

    fn set_error_handler(&self, handler: ErrorHandler);

    fn set_playback_time_handler(&self, handler: PlaybackTimeHandler);

    fn set_idle_handler(&self, handler: IdleHandler);

    fn set_idle_interval(&self, interval: Duration);

    /// Deliver only records accepted by every filter.
    fn add_filter(&self, filter: Filter);

    fn reset_filters(&self);
}
