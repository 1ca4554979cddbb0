mod conn;
mod migrations;
mod schema;

pub mod async_db;
pub mod db;
pub mod models;

pub(crate) use schema::*;

pub use conn::{
    ConnectionPool, DatabaseConfig, DatabaseConfigError, PoolError, connection_pool, establish_async,
};
pub use migrations::{MigrationError, run_migrations};

pub use diesel::result::Error as QueryError;
pub use diesel::{Connection, ConnectionError, PgConnection, QueryResult};
pub use diesel_async::{AsyncConnection, AsyncPgConnection};
