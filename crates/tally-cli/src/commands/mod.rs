pub mod catalog;
pub mod common;
pub mod config;
pub mod day;
pub mod order;
pub mod sync;
pub mod watch;
