pub mod config;
pub mod context;
pub mod cursor;
pub mod driver;
pub mod emit;
pub mod error;
pub mod event;
pub mod fetch;
pub mod pipeline;
pub mod run;
pub mod test_utils;
