//! The three built-in primitives, the only leaves of every execution chain.

pub mod http;
pub mod stream;
pub mod subprocess;

pub use http::HttpPrimitive;
pub use http::HttpResult;
pub use stream::ReturnSink;
pub use stream::StreamSink;
pub use subprocess::KillResult;
pub use subprocess::SpawnResult;
pub use subprocess::StatusResult;
pub use subprocess::SubprocessPrimitive;
pub use subprocess::SubprocessResult;
