pub mod sessions;
pub mod tokens;

pub use sessions::*;
pub use tokens::*;
