//! Connectivity tracking and the durable queue of writes made while offline.
//!
//! [`OfflineManager`] owns the connection status and the queue. Writes that
//! couldn't reach the backend are enqueued as [`PendingOperation`]s,
//! persisted through a [`QueueStore`] and replayed in order once the
//! backend is reachable again.

mod manager;
mod notify;
mod operation;
mod probe;
mod status;
mod store;

pub use manager::{ManagerOptions, OfflineManager, SyncReport};
pub use notify::{BroadcastSink, Notice, NoticeKind, NotificationSink, TracingSink};
pub use operation::{PendingOperation, MAX_RETRIES};
pub use probe::{ConnectivityProbe, HealthProbe, LinkEvent};
pub use status::{ConnectionStatus, Listeners, Subscription};
pub use store::{MemoryQueueStore, QueueStore, SqliteQueueStore};
