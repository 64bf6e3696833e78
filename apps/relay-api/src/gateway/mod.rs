pub mod events;
pub mod fanout;
pub mod handler;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stream;
