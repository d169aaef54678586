pub mod enqueue;
pub mod parse;
pub mod status;
