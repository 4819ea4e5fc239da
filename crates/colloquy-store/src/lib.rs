//! Durable state: the key-value adapter, the conversation store, persisted
//! preferences and conversation export/import.

#![deny(unsafe_code)]

pub mod conversations;
pub mod database;
pub mod error;
pub mod kv;
pub mod preferences;
pub mod schema;
pub mod transfer;

pub use conversations::{ConversationStore, StoreEvent};
pub use database::Database;
pub use error::StoreError;
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use preferences::PreferencesRepo;
pub use transfer::ExportDocument;
