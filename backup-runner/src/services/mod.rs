pub mod driver;
pub mod watcher;
