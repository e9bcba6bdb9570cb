mod cache;
mod fetch;
mod serve;
mod watch;

pub use cache::{execute_cache_delete, execute_cache_list, execute_cache_prune, prune_older_than};
pub use fetch::execute_fetch;
pub use serve::execute_serve;
pub use watch::{describe_event, execute_watch};
