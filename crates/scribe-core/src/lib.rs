pub mod checkpoint;
pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod report;
pub mod stream;
pub mod tools;
