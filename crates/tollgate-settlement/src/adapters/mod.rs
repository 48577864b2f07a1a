pub mod internal;

pub use internal::{ConfirmationMode, InternalChain};
