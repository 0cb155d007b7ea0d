pub mod outbound;
pub mod outbox;
pub mod render;
pub mod types;

pub use outbound::{CallbackGuard, ChannelError, Outbound, SentMessage};
pub use outbox::Outbox;
pub use render::{render_chunks, Dialect};
pub use types::{
    ChatRef, EventKind, IncomingEvent, IncomingMedia, IncomingMessage, OutgoingAction,
    OutgoingMedia, UserRef,
};
