pub mod claims;
pub mod csrf;
pub mod store;

pub use claims::{decode_claims, token_is_expired, Claims};
pub use csrf::{CsrfManager, CSRF_HEADER};
pub use store::{DeviceState, MemoryBackend, SessionStore, StorageBackend};
