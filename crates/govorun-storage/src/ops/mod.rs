//! Entity operations, implemented directly on [`SqliteSource`](crate::source::SqliteSource).
//!
//! The storage router exposes the same surface with source routing on top;
//! everything here operates on exactly one source.

pub mod cache;
pub mod chats;
pub mod media;
pub mod messages;
pub mod settings;
pub mod spam;
pub mod tasks;
