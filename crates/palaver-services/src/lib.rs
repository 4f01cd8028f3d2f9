//! palaver-services — the discovery and messaging services, the peer
//! registry they share with nobody, and the typed command/event channels
//! that are their only outside surface.

pub mod channel;
pub mod discovery;
pub mod messaging;
pub mod registry;

pub use channel::{DiscoveryCommand, Event, EventReceiver, EventSender, MessagingCommand};
pub use discovery::DiscoveryService;
pub use messaging::{MessagingService, TransportError};
pub use registry::{PeerRecord, Registry};
