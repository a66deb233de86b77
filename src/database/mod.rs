//! Database module

pub mod operations;
pub mod schema;

// Re-export for convenience
pub use operations::DatabaseManager;
pub use schema::initialize_database;
