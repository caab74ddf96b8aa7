// aceproxy-livestream - Stream multiplexing in front of an AceStream engine
//
// Architecture:
// - engine/      - Engine session API (getstream, playback, stop)
// - livestream/  - Stream lifecycle, registry, fan-out, proxy service
// - protocols/   - HTTP front door (axum)
//
// Every viewer of the same key shares one upstream engine session.

pub mod engine;
pub mod error;
pub mod livestream;
pub mod protocols;

pub use engine::{EngineApi, HttpEngineClient, UpstreamSession};
pub use error::{StreamError, StreamResult};
pub use livestream::{ClientMeta, ProxyService, StreamSettings, StreamState, Subscription};
pub use protocols::{create_proxy_router, HttpProxyState};
