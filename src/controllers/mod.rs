pub mod health;
pub mod session;
pub mod websocket;

pub use health::*;
pub use session::*;
pub use websocket::*;
