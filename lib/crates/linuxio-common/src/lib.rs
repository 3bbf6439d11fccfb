pub mod authproto;
pub mod bootstrap;
pub mod error;
pub mod session;
pub mod wire;

pub use authproto::{AuthRequest, AuthResponse, Env};
pub use bootstrap::Bootstrap;
pub use error::Error;
pub use session::{Mode, Session};
