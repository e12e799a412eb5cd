pub mod api;
pub mod error;
pub mod events;
pub mod models;
pub mod remote;

pub use api::{
    ChannelRow, MessageRow, NewMessage, NewReaction, PageBound, PageQuery, ReactionRow,
};
pub use error::{RemoteError, RowError};
pub use events::{ChangeEvent, ChangeRow, SubscriptionHandle, SubscriptionState};
pub use models::{
    Delivery, Message, MessageId, MessageKey, Reaction, ReactionId, Room, RoomId, TempId,
    UserIdentity,
};
pub use remote::{RemoteStore, Subscription};
