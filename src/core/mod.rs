pub mod compiler;
pub mod confidence;
pub mod executor;
pub mod expr;
pub mod filter;
pub mod formatter;
pub mod frame;
pub mod having;
pub mod region;
pub mod time_window;
pub mod transform;
