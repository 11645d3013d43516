pub mod error;
pub mod machine;
pub mod project;
pub mod state;
