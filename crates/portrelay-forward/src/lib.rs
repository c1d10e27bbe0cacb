//! TCP forward multiplexer
//!
//! Accepts client connections on local listening ports and mediates their
//! byte streams through request/response messages correlated by request id
//! over an abstract message relay. Tracks live forwarded connections and
//! bound listeners in concurrent registries and emulates HTTP CONNECT
//! replies for proxy-mode listeners.

pub mod http_connect;
pub mod multiplexer;
pub mod registry;
pub mod relay;

pub use http_connect::{CONNECT_ERROR, CONNECT_SUCCESS};
pub use multiplexer::{ForwardError, ForwardMultiplexer, ListeningChange, RequestHandler};
pub use registry::{ConnectionRegistry, ForwardEntry, ListenerRegistry};
pub use relay::{ForwardSender, MessageRelay, RelayError, RelayForwarder};
