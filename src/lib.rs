pub mod b524;
pub mod commands;
pub mod discovery;
pub mod groups;
pub mod output;
pub mod plan;
pub mod progress;
pub mod schema;
pub mod session;
pub mod transport;
pub mod value;
