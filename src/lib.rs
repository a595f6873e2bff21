pub mod app;
pub mod cache;
pub mod config;
pub mod decode;
pub mod encode;
pub mod error;
pub mod handlers;
pub mod logsink;
pub mod normalize;
pub mod openai;
pub mod reasoning;
pub mod registry;
pub mod stream;
pub mod transform;
pub mod upstream;
