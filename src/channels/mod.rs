pub mod codec;
pub mod dispatcher;
pub mod manager;

pub use codec::{EventCodec, ServerEvent};
pub use dispatcher::{EventDispatcher, Subscription};
pub use manager::{ChannelConfig, ChannelManager, RECONNECT_SCHEDULE_SECONDS};
