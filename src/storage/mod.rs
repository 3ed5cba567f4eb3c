pub mod gateway;
pub mod memory;
pub mod retry;
pub mod sqlite;

pub use gateway::{validate_table_name, Gateway, GatewayError, HoldingRow};
pub use memory::{MemoryGateway, WriteCounts};
pub use retry::RetryPolicy;
pub use sqlite::SqliteGateway;
