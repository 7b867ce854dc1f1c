pub mod id;
pub mod snowflake;

pub use snowflake::{SnowflakeGenerator, MAX_WORKER_ID};
