use std::collections::BTreeSet;
use std::sync::Arc;

use log::info;

use longform_core::{
    Config, GenerationClient, GenerationClientBuilder, ModelClass, ProviderAdapter,
    ProviderConfig, SharedLogSink,
};

use crate::base_url::normalize_base_url;
use crate::error::AdapterError;
use crate::gemini::GeminiAdapter;
use crate::models::ModelNames;
use crate::openai::{AzureOpenAiAdapter, OpenAiLikeAdapter};

/// Default API root for each OpenAI-compatible interface format.
fn default_base_url(format: &str) -> Option<&'static str> {
    let url = match format {
        "openai" => "https://api.openai.com/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "zhipu" | "智谱" => "https://open.bigmodel.cn/api/paas/v4",
        "doubao" | "ark" | "火山引擎" => "https://ark.cn-beijing.volces.com/api/v3",
        "ollama" => "http://localhost:11434/v1",
        "ml studio" => "http://localhost:5000/v1",
        "grok" => "https://api.x.ai/v1",
        "siliconflow" | "硅基流动" => "https://api.siliconflow.cn/v1",
        "dashscope" | "阿里云百炼" => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        _ => return None,
    };
    Some(url)
}

/// Interface format of a provider entry; the entry name stands in when the
/// format is left empty.
pub fn interface_format(name: &str, config: &ProviderConfig) -> String {
    let format = if config.interface_format.trim().is_empty() {
        name
    } else {
        config.interface_format.as_str()
    };
    format.trim().to_lowercase()
}

pub fn create_provider_adapter(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
    let format = interface_format(name, config);
    let api_key = config.api_key.trim();

    match format.as_str() {
        "azure openai" | "azure" => Ok(Arc::new(AzureOpenAiAdapter::new(
            api_key,
            &config.base_url,
            config.max_tokens,
            config.temperature,
        )?)),
        "gemini" => Ok(Arc::new(GeminiAdapter::new(
            api_key,
            &config.base_url,
            ModelNames::from_config(name, config)?,
            config.max_tokens,
            config.temperature,
        )?)),
        other => {
            let default = default_base_url(other).ok_or_else(|| {
                AdapterError::InvalidConfig(format!(
                    "provider `{name}` uses unsupported interface format `{other}`"
                ))
            })?;
            let base_url = normalize_base_url(&config.base_url, default)?;
            Ok(Arc::new(OpenAiLikeAdapter::new(
                &base_url,
                (!api_key.is_empty()).then(|| api_key.to_string()),
                ModelNames::from_config(name, config)?,
                config.max_tokens,
                config.temperature,
            )?))
        }
    }
}

/// Builds the generation client for every provider that appears in a route.
/// Configured providers no route mentions are left out.
pub fn build_generation_client(
    config: &Config,
    sink: SharedLogSink,
) -> Result<GenerationClient, AdapterError> {
    config.validate()?;

    let routed: BTreeSet<&str> = config
        .routing
        .values()
        .flatten()
        .map(String::as_str)
        .collect();

    let mut builder = GenerationClientBuilder::from_config(config).sink(sink);
    for name in routed {
        let provider = config.get_provider(name).ok_or_else(|| {
            AdapterError::InvalidConfig(format!("routed provider `{name}` is not configured"))
        })?;
        let adapter = create_provider_adapter(name, provider)?;
        info!(
            "registered provider `{name}` ({}) with planning model `{}` and drafting model `{}`",
            interface_format(name, provider),
            adapter.model(ModelClass::Planning),
            adapter.model(ModelClass::Drafting),
        );
        builder = builder.provider(name, adapter);
    }
    Ok(builder.build()?)
}
