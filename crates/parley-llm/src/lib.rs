pub mod converter;
pub mod echo;
mod inflight;
pub mod mock;
pub mod openai;
pub mod sse;

pub use echo::EchoBackend;
pub use mock::{MockBackend, MockResponse};
pub use openai::{OpenAiBackend, OpenAiConfig};
