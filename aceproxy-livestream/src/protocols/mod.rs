pub mod http;

pub use http::{create_proxy_router, HttpProxyState};
