//! Database models split into separate files.

pub mod stored_notification;

pub use self::stored_notification::*;
