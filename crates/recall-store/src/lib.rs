pub mod conversations;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use store::SqliteConversationStore;
