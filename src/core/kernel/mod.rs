/// lumenx kernel - transport layer for the client runtime
///
/// This module provides the service-agnostic transport layer for both HTTP
/// and WebSocket communication. The kernel contains only transport logic and
/// generic interfaces; credential handling, recovery flows and channel policy
/// live above it.
///
/// # Architecture
///
/// ## Transport Layer
/// - `HttpTransport`: Unified HTTP execution interface
/// - `ReqwestTransport`: reqwest-backed implementation with a shared cookie jar
/// - `WsSession`: WebSocket connection management
///
/// ## Message Handling
/// - `WsCodec`: Channel message encoding/decoding seam
///
/// # Key Principles
///
/// 1. **Transport Only**: The kernel contains NO recovery or credential logic
/// 2. **Pluggable**: All components are trait-based and configurable
/// 3. **Observable**: Tracing on every dispatch and handshake
/// 4. **Testable**: Dependency injection for easy testing
pub mod codec;
pub mod rest;
pub mod ws;

// Re-export key types for convenience
pub use codec::WsCodec;
pub use rest::{
    HttpTransport, MultipartField, MultipartValue, ReqwestTransport, RequestBody, TransportBuilder,
    TransportConfig, TransportRequest, TransportResponse,
};
pub use ws::{TungsteniteWs, WsConfig, WsSession};
