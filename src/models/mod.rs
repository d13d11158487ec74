//! Entity types synchronized by the engine.

mod layout;
mod session;
mod stream;

pub use layout::LayoutEntity;
pub use session::SessionEntity;
pub use stream::{Platform, StreamEntity};
