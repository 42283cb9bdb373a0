pub mod dedup;
pub mod pipeline;
