pub mod auth_api;
pub mod pipeline;
pub mod transform;

pub use auth_api::{AuthApi, AuthSession, LoginRequest, RegisterRequest};
pub use pipeline::{ApiClient, FileUpload};
pub use transform::normalize;
