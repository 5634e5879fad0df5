pub mod config;
pub mod planning;
pub mod session;
pub mod transcript;

pub use config::*;
pub use planning::*;
pub use session::*;
pub use transcript::*;
