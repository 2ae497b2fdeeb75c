// tl-test-utils: A mock broker server for testing session clients.
//
// Speaks the length-prefixed envelope protocol over plain TCP on
// 127.0.0.1:<random port>.  Each test spins up its own isolated instance.

mod mock_broker;

pub use mock_broker::{MockBrokerServer, ReceivedEnvelope};
