pub mod api;
pub mod channel;
pub mod error;
pub mod flow;
pub mod pending;
pub mod reconciler;
pub mod refresher;
pub mod selector;
pub mod store;
pub mod types;

pub use error::{ApiError, ApiResult, StoreError};
pub use types::*;
