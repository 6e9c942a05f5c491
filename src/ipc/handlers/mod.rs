pub mod core;
pub mod options;
pub mod pipeline;
