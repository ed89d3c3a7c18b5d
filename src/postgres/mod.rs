// ABOUTME: PostgreSQL connection manager module
// ABOUTME: Exports the pooled Database handle, extensions, and privilege checks

pub mod connection;
pub mod extensions;
pub mod pool;
pub mod privileges;

pub use extensions::{ensure_extensions, get_installed_extensions, Extension};
pub use pool::{Database, PoolStats, PooledClient};
pub use privileges::{check_current_privileges, PrivilegeCheck};
