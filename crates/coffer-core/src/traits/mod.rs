pub mod store;
pub mod token;

pub use store::{AttributeFilter, ObjectStore};
pub use token::{token_key, TokenTable};
