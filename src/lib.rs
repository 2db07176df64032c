pub mod api;
pub mod auth;
pub mod channels;
pub mod client;
pub mod core;

pub use client::LumenClient;
pub use core::{
    config::{ClientConfig, CredentialMode},
    errors::ClientError,
    types::*,
};
pub use api::{ApiClient, AuthSession, FileUpload, LoginRequest, RegisterRequest};
pub use channels::{ChannelManager, EventDispatcher, Subscription};
