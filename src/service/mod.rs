pub mod builder;
pub mod compose;
pub mod docker;
pub mod fetcher;
pub mod inventory;
pub mod process;
pub mod snapshot;
pub mod supervisor;
