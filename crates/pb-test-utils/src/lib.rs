// pb-test-utils: Shared test utilities for the agent suite.
//
// Provides an in-process mock REST server and a scriptable mock stream
// server so integration tests can drive the agent without the real cloud.

pub mod mock_api_server;
pub mod mock_stream_server;

pub use mock_api_server::MockApiServer;
pub use mock_stream_server::MockStreamServer;
