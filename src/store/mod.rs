pub mod chats;
pub mod messages;

pub use chats::ChatDirectory;
pub use messages::MessageStore;
