pub mod group;
pub mod request;
pub mod notification;
pub mod schemas;

pub use group::*;
pub use request::*;
pub use notification::*;
pub use schemas::*;
