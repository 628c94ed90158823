//! Booking engine: inbound-message coordination, slot allocation, and
//! spreadsheet-mirror reconciliation on top of the shared SQLite store.

pub mod allocator;
pub mod coordinator;
pub mod mirror;
pub mod processor;
pub mod reconciler;

pub use allocator::{AllocationRequest, SlotAllocator};
pub use coordinator::MessageCoordinator;
pub use mirror::{HttpMirrorStore, InMemoryMirrorStore, MirrorSlot, MirrorStore, NoopMirrorStore};
pub use processor::{ReplyDelivery, TurnDriver, TurnOutcome, TurnProcessor};
pub use reconciler::{DayReport, MirrorReconciler, ReconcileError};
