// Storage is grouped as `impl Database` blocks, one file per table family
pub mod cluster_index;
pub mod core;
pub mod filtered;
mod locks;
pub mod raw;
pub mod review;
mod schema;
pub mod summary;

// Re-export Database and essential traits
pub use self::core::Database;
pub use self::core::DbLockErrorExt;
pub use sqlx::Row;
