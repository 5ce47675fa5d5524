mod base_url;
mod error;
mod factory;
mod gemini;
mod models;
mod openai;

pub use base_url::{join_endpoint, normalize_base_url};
pub use error::{classify_status, AdapterError};
pub use factory::{build_generation_client, create_provider_adapter, interface_format};
pub use gemini::{GeminiAdapter, DEFAULT_GEMINI_BASE_URL};
pub use models::ModelNames;
pub use openai::{AzureOpenAiAdapter, OpenAiLikeAdapter};
