pub mod converter;
pub mod decoder;
pub mod parser;
pub mod provider;

pub mod mock;

pub use decoder::{DecodedStream, StreamDecoder};
pub use mock::{MockProvider, MockResponse};
pub use parser::parse_response;
pub use provider::{OpenAiCompatProvider, ProviderConfig};
