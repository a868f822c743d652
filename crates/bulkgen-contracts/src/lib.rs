pub mod batch;
pub mod events;
pub mod images;
pub mod models;
pub mod prompts;
pub mod runs;
