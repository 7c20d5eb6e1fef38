pub mod converter;
pub mod mock;
pub mod openai;
pub mod reliable;
pub mod sse;

pub use mock::{MockProvider, MockResponse};
pub use openai::{OpenAiProvider, ProviderConfig};
pub use reliable::{ReliableConfig, ReliableProvider};
