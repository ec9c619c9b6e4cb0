pub mod notification_repository;

pub use self::notification_repository::*;
