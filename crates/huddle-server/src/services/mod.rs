//! Background and domain services.

pub mod sessions;
pub mod stream;

pub use sessions::SessionService;
pub use stream::{StreamCoordinator, StreamEvent, StreamRegistry};
