/// Connection layer
///
/// Everything needed to keep one sensor stream alive and deliver
/// its readings in-process:
///
/// - transport: how a link is opened and read (WebSocket by default)
/// - backoff:   when to retry after the link is lost
/// - registry:  who receives parsed readings
/// - manager:   the state machine tying the three together
///
/// Callers only need `ConnectionManager` and `Subscription`.
pub mod backoff;
pub mod manager;
pub mod registry;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use manager::{ConnectionManager, ConnectionState, LinkOptions};
pub use registry::Subscription;
