pub mod auxiliary;
pub mod mock;
pub mod provider;
pub mod reader;
pub mod search;
pub mod sse;

pub use auxiliary::{ModelJudge, ModelTitleGenerator};
pub use provider::OpenAiCompatProvider;
pub use reader::{read_stream, PauseGate, ReadOutcome, StreamControls};
pub use search::{format_search_results, WebSearchClient};
pub use sse::ChatStreamParser;
