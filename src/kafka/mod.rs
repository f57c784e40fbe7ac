pub mod producer;
pub mod consumer;
pub mod admin;

pub use producer::*;
pub use consumer::*;
pub use admin::*;
