pub mod cache;
pub mod coordinator;
pub mod deferred;
pub mod events;
pub mod fanout;
pub mod provider;
pub mod registry;
pub mod selection;
pub mod sweeper;

pub use cache::{ViewCache, ViewKey};
pub use coordinator::{StampedView, SyncCoordinator, SyncParts};
pub use deferred::{CommitScope, DeferredCommitQueue, UnitOfWork};
pub use events::{BroadcastMessage, IncrementalDelta, Topic};
pub use fanout::{Broadcaster, TopicBroadcast};
pub use provider::{DisplayInfo, RoomSnapshotProvider, UserDirectory};
pub use registry::{Departure, SessionRegistry};
pub use selection::SelectionBoard;
