//! Sessions that translate timestamps between the local clock domain and a
//! peripheral's opaque time representation, plus the registry that pairs
//! services with time-sync providers as they publish.

#[cfg(test)]
pub mod fake;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

/// State changes delivered to a session's event handler. While a session is
/// inactive, translation calls fail without being fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncEvent {
    Inactive,
    Active,
}

/// Implementation-specific indicator of translation precision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncPrecision {
    Unknown,
    Low,
    High,
}

/// Possible errors translating timestamps
#[derive(Debug, Error)]
pub enum TimeSyncError {
    #[error("session has not been activated")]
    NotActivated,
    #[error("time-sync is not currently available")]
    NotReady,
    #[error("session has been cancelled")]
    Cancelled,
    #[error("no event handler registered")]
    MissingHandler,
    #[error("event carries no time-sync timestamp")]
    Unsupported,
    #[error("provider rejected the translation: {0}")]
    Rejected(String),
}

/// Translates between local time and a provider-defined opaque byte
/// representation. The byte format is owned entirely by the provider; no
/// layout or endianness assumption is made here.
pub trait TimeSyncProvider: Send + Sync {
    /// Current availability of the provider
    fn current_state(&self) -> (TimeSyncEvent, TimeSyncPrecision);
    /// Translate an opaque provider timestamp into the local clock domain
    fn to_synced_time(&self, data: &[u8]) -> Result<u64, TimeSyncError>;
    /// Translate a local timestamp into the provider's opaque representation
    fn to_time_data(&self, synced_time: u64) -> Result<Vec<u8>, TimeSyncError>;
}

pub type ProviderRef = Arc<dyn TimeSyncProvider>;

/// Handler invoked when the provider's availability changes
pub type EventHandler = Box<dyn FnMut(TimeSyncEvent, TimeSyncPrecision) + Send>;
/// Handler invoked exactly once after cancellation drains
pub type CancelHandler = Box<dyn FnOnce() + Send>;

/// Lifecycle states of a [TimeSyncSession]. Transitions are one-directional
/// within an epoch; only the orthogonal active flag toggles while activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    Activated,
    Cancelling,
    Cancelled,
}

/// A session pairing a consumer with one time-sync provider. All calls must
/// come from the owning service's serialized context; the session itself
/// holds no locks.
pub struct TimeSyncSession {
    provider: ProviderRef,
    state: SessionState,
    active: bool,
    event_handler: Option<EventHandler>,
    cancel_handler: Option<CancelHandler>,
    not_ready_count: u64,
    to_local_count: u64,
    to_remote_count: u64,
}

impl TimeSyncSession {
    pub fn new(provider: ProviderRef) -> Self {
        Self {
            provider,
            state: SessionState::Init,
            active: false,
            event_handler: None,
            cancel_handler: None,
            not_ready_count: 0,
            to_local_count: 0,
            to_remote_count: 0,
        }
    }

    /// Register the handler for provider state changes. Must be called
    /// before activation.
    pub fn set_event_handler(&mut self, handler: EventHandler) {
        self.event_handler = Some(handler);
    }

    /// Register the handler invoked once after cancellation completes
    pub fn set_cancel_handler(&mut self, handler: CancelHandler) {
        self.cancel_handler = Some(handler);
    }

    /// Activate the session. The provider's current state is delivered to the
    /// event handler once, immediately. Activating more than once is a no-op.
    pub fn activate(&mut self) -> Result<(), TimeSyncError> {
        if self.state != SessionState::Init {
            return Ok(());
        }
        if self.event_handler.is_none() {
            return Err(TimeSyncError::MissingHandler);
        }
        self.state = SessionState::Activated;
        let (event, precision) = self.provider.current_state();
        self.handle_provider_event(event, precision);
        Ok(())
    }

    /// Deliver a provider state change. Toggles the active flag and forwards
    /// the event to the registered handler. Ignored outside the activated
    /// state.
    pub fn handle_provider_event(&mut self, event: TimeSyncEvent, precision: TimeSyncPrecision) {
        if self.state != SessionState::Activated {
            return;
        }
        log::debug!("time-sync event: {event:?} (precision: {precision:?})");
        match event {
            TimeSyncEvent::Active => {
                log::debug!(
                    "{} attempts to time-sync before active",
                    self.not_ready_count
                );
                self.active = true;
            }
            TimeSyncEvent::Inactive => {
                if self.active {
                    log::debug!(
                        "synced {} remote, {} local timestamps during session",
                        self.to_local_count,
                        self.to_remote_count
                    );
                    self.not_ready_count = 0;
                    self.to_local_count = 0;
                    self.to_remote_count = 0;
                }
                self.active = false;
            }
        }
        if let Some(handler) = self.event_handler.as_mut() {
            handler(event, precision);
        }
    }

    /// Cancel the session. In-flight work has already drained because all
    /// calls share the owning context, so the cancel handler runs before this
    /// returns. Cancelling without a prior activation, or twice, is a no-op.
    pub fn cancel(&mut self) {
        if self.state != SessionState::Activated {
            return;
        }
        self.state = SessionState::Cancelling;
        self.active = false;
        self.state = SessionState::Cancelled;
        if let Some(handler) = self.cancel_handler.take() {
            handler();
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Activated && self.active
    }

    /// Translate an opaque provider timestamp into local time. Valid only
    /// while the session is activated and the provider is active.
    pub fn synced_time_from_data(&mut self, data: &[u8]) -> Result<u64, TimeSyncError> {
        self.check_ready()?;
        let synced = self.provider.to_synced_time(data)?;
        self.to_local_count += 1;
        Ok(synced)
    }

    /// Translate a local timestamp into the provider's opaque representation
    pub fn data_from_synced_time(&mut self, synced_time: u64) -> Result<Vec<u8>, TimeSyncError> {
        self.check_ready()?;
        let data = self.provider.to_time_data(synced_time)?;
        self.to_remote_count += 1;
        Ok(data)
    }

    /// Rejected translation attempts while the session was not ready
    pub fn not_ready_count(&self) -> u64 {
        self.not_ready_count
    }

    /// Successful (to-local, to-remote) translation counts
    pub fn translation_counts(&self) -> (u64, u64) {
        (self.to_local_count, self.to_remote_count)
    }

    fn check_ready(&mut self) -> Result<(), TimeSyncError> {
        match self.state {
            SessionState::Cancelling | SessionState::Cancelled => Err(TimeSyncError::Cancelled),
            SessionState::Init => {
                self.not_ready_count += 1;
                Err(TimeSyncError::NotActivated)
            }
            SessionState::Activated if !self.active => {
                self.not_ready_count += 1;
                Err(TimeSyncError::NotReady)
            }
            SessionState::Activated => Ok(()),
        }
    }
}

/// Pairs services awaiting a time-sync provider with providers as they
/// publish. Matching is by physical device identity; each watcher is
/// notified at most once.
#[derive(Default)]
pub struct TimeSyncRegistry {
    providers: Vec<(String, ProviderRef)>,
    watchers: Vec<(String, oneshot::Sender<ProviderRef>)>,
}

impl TimeSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a provider for the given physical device. The
    /// returned channel fires once when a matching provider publishes, or
    /// immediately if one already has.
    pub fn watch(&mut self, device_id: &str) -> oneshot::Receiver<ProviderRef> {
        let (tx, rx) = oneshot::channel();
        if let Some((_, provider)) = self.providers.iter().find(|(id, _)| id == device_id) {
            let _ = tx.send(provider.clone());
            return rx;
        }
        self.watchers.push((device_id.to_string(), tx));
        rx
    }

    /// Publish a provider for the given physical device, notifying pending
    /// watchers for the same device.
    pub fn publish(&mut self, device_id: &str, provider: ProviderRef) {
        log::debug!("time-sync provider published for {device_id}");
        let mut remaining = Vec::new();
        for (id, tx) in self.watchers.drain(..) {
            if id == device_id {
                let _ = tx.send(provider.clone());
            } else {
                remaining.push((id, tx));
            }
        }
        self.watchers = remaining;
        self.providers.push((device_id.to_string(), provider));
    }
}
