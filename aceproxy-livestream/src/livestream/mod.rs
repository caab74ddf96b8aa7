// Stream multiplexing core
//
// One engine session per key, shared by every client watching it:
// - registry  - key -> Stream admission
// - stream    - per-key lifecycle and the upstream fetch task
// - fanout    - per-chunk delivery with slow/stale client eviction
// - proxy     - subscribe/unsubscribe and introspection for callers

pub mod client;
pub mod fanout;
pub mod proxy;
pub mod registry;
pub mod stream;

pub use client::{group_viewers, ClientId, ClientInfo, ClientMeta, ViewerInfo};
pub use fanout::{DistributionReport, Distributor};
pub use proxy::{ProxyService, StreamStats, StreamSummary, Subscription};
pub use registry::StreamRegistry;
pub use stream::{CloseReason, Stream, StreamSettings, StreamState};
