// Types, wire formats and the event registry shared by every Skyway crate.

pub mod constants;
pub mod data_message;
pub mod error;
pub mod events;
pub mod ice;
pub mod protocol;
pub mod session;
pub mod types;

pub use data_message::{DataMessage, FileInfo, TransferInfo};
pub use error::{
    BootstrapError, MediaAccessError, NegotiationError, ProtocolError, SkywayError, TransferError,
};
pub use events::{Event, EventBus, EventKind, Flow, HandlerId, ReceivedItem, TransferStatus};
pub use ice::{IceConfig, IceServer};
pub use protocol::{Envelope, Frame, RedirectAction};
pub use session::{Credentials, MediaConstraints, NegotiationConfig, Session};
pub use types::*;
