//! 远程后端：OpenAI 兼容 API
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；检索上下文作为第二条 system 消息传入。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, FinishReason as ApiFinishReason,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{
    classify_error_text, BackendError, BackendRequest, BackendResponse, FinishReason, LlmBackend,
    TokenUsage,
};

/// 远程主后端：持有 Client 与 model 名
pub struct RemoteBackend {
    client: Client<OpenAIConfig>,
    model: String,
    name: String,
}

impl RemoteBackend {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            name: format!("remote:{}", model),
        }
    }

    fn to_openai_messages(
        &self,
        request: &BackendRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, BackendError> {
        let build_err = |e: async_openai::error::OpenAIError| {
            BackendError::Api(format!("failed to build request: {}", e))
        };
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.clone())
                    .build()
                    .map_err(build_err)?,
            ));
        }
        let context = request.context_block();
        if !context.is_empty() {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(context)
                    .build()
                    .map_err(build_err)?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(build_err)?,
        ));
        Ok(messages)
    }
}

#[async_trait]
impl LlmBackend for RemoteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(request)?)
            .max_completion_tokens(request.max_tokens)
            .build()
            .map_err(|e| BackendError::Api(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| classify_error_text(&e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let choice = response
            .choices
            .first()
            .ok_or_else(|| BackendError::InvalidResponse("no choices returned".to_string()))?;

        let finish_reason = match choice.finish_reason {
            Some(ApiFinishReason::Length) => FinishReason::Length,
            Some(_) => FinishReason::Stop,
            None => FinishReason::Unknown,
        };

        Ok(BackendResponse {
            text: choice.message.content.clone().unwrap_or_default(),
            usage,
            finish_reason,
        })
    }
}
