pub mod api;
pub mod close;
pub mod message;
pub mod models;

pub use close::CloseCode;
pub use message::{
    ChatData, CommandData, CommandReply, ControlFrame, KeyGrant, Message, MessageBody,
    MessageKind, StatusData,
};
pub use models::{ConnectionId, IdentityId};
