//! Symbols related to communicating with the OpenRouter chat completions API

use crate::prelude::*;
use crate::util;
use crate::{err, http, Result};
use rand::seq::SliceRandom;
use serde::Deserialize;

/// Declarations of the OpenRouter JSON API types. Only the subset of the
/// schema we actually send and read is declared here.
pub(crate) mod rpc {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    pub(crate) struct ChatCompletionRequest<'s> {
        pub(crate) model: &'s str,
        pub(crate) messages: &'s [Message],
    }

    #[derive(Serialize, Clone)]
    pub(crate) struct Message {
        pub(crate) role: &'static str,
        pub(crate) content: Content,
    }

    impl Message {
        pub(crate) fn system(text: impl Into<String>) -> Self {
            Self {
                role: "system",
                content: Content::Text(text.into()),
            }
        }

        pub(crate) fn user(content: Content) -> Self {
            Self {
                role: "user",
                content,
            }
        }
    }

    #[derive(Serialize, Clone)]
    #[serde(untagged)]
    pub(crate) enum Content {
        Text(String),
        Parts(Vec<ContentPart>),
    }

    #[derive(Serialize, Clone)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(crate) enum ContentPart {
        Text { text: String },
        ImageUrl { image_url: ImageUrl },
    }

    #[derive(Serialize, Clone)]
    pub(crate) struct ImageUrl {
        pub(crate) url: String,
    }

    #[derive(Deserialize)]
    pub(crate) struct ChatCompletionResponse {
        pub(crate) choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    pub(crate) struct Choice {
        pub(crate) message: ChoiceMessage,
    }

    #[derive(Deserialize)]
    pub(crate) struct ChoiceMessage {
        pub(crate) content: Option<String>,
    }
}

util::def_url_base!(openrouter_api, "https://openrouter.ai/api/v1");

#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    /// Comma-separated list in the env var. Keys are tried in random order
    /// until one of them accepts the request, which spreads the load and
    /// survives individual keys hitting their rate limits.
    pub(crate) api_keys: Vec<String>,

    /// Prepended to every conversation as the first system message.
    #[serde(default)]
    pub(crate) system_prompt: Option<String>,
}

pub(crate) struct CompletionService {
    http_client: http::Client,
    config: Config,
}

impl CompletionService {
    pub(crate) fn new(http_client: http::Client, config: Config) -> Self {
        Self {
            http_client,
            config,
        }
    }

    pub(crate) fn system_prompt(&self) -> Option<&str> {
        self.config.system_prompt.as_deref()
    }

    /// Request a chat completion and return the assistant's reply text.
    pub(crate) async fn complete(&self, model: &str, messages: &[rpc::Message]) -> Result<String> {
        if self.config.api_keys.is_empty() {
            return Err(err!(CompletionError::NoApiKeys));
        }

        let mut keys: Vec<_> = self.config.api_keys.iter().collect();
        keys.shuffle(&mut rand::thread_rng());

        let mut last_err = None;

        for (attempt, api_key) in keys.iter().enumerate() {
            let result: Result<rpc::ChatCompletionResponse> = self
                .http_client
                .post(openrouter_api(["chat", "completions"]))
                .bearer_auth(api_key)
                .send_and_read_json(rpc::ChatCompletionRequest { model, messages })
                .await;

            match result {
                Ok(response) => return extract_reply(response),
                Err(err) => {
                    warn!(
                        attempt,
                        total_keys = keys.len(),
                        err = tracing_err(&err),
                        "Completion request failed, trying the next API key"
                    );
                    last_err = Some(err);
                }
            }
        }

        // The loop ran at least once, so `last_err` is set here
        let source = Box::new(last_err.unwrap_or_else(|| err!(CompletionError::NoApiKeys)));

        Err(err!(CompletionError::AllKeysFailed { source }))
    }
}

fn extract_reply(response: rpc::ChatCompletionResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| err!(CompletionError::MissingContent))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CompletionError {
    #[error("No OpenRouter API keys are configured")]
    NoApiKeys,

    #[error("The completion request failed with every configured API key")]
    AllKeysFailed { source: Box<crate::Error> },

    #[error("The completion response contains no message content")]
    MissingContent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn request_serialization_matches_the_wire_format() {
        let messages = vec![
            rpc::Message::system("You are a helpful assistant"),
            rpc::Message::user(rpc::Content::Parts(vec![
                rpc::ContentPart::Text {
                    text: "What is on this picture?".to_owned(),
                },
                rpc::ContentPart::ImageUrl {
                    image_url: rpc::ImageUrl {
                        url: "data:image/jpeg;base64,AAAA".to_owned(),
                    },
                },
            ])),
        ];

        let request = rpc::ChatCompletionRequest {
            model: "gpt-4o",
            messages: &messages,
        };

        expect![[r#"
            {
              "model": "gpt-4o",
              "messages": [
                {
                  "role": "system",
                  "content": "You are a helpful assistant"
                },
                {
                  "role": "user",
                  "content": [
                    {
                      "type": "text",
                      "text": "What is on this picture?"
                    },
                    {
                      "type": "image_url",
                      "image_url": {
                        "url": "data:image/jpeg;base64,AAAA"
                      }
                    }
                  ]
                }
              ]
            }"#]]
        .assert_eq(&crate::encoding::to_json_string_pretty(&request));
    }

    #[test]
    fn reply_extraction_rejects_empty_responses() {
        let empty = rpc::ChatCompletionResponse { choices: vec![] };
        assert!(extract_reply(empty).is_err());

        let no_content = rpc::ChatCompletionResponse {
            choices: vec![rpc::Choice {
                message: rpc::ChoiceMessage { content: None },
            }],
        };
        assert!(extract_reply(no_content).is_err());

        let ok = rpc::ChatCompletionResponse {
            choices: vec![rpc::Choice {
                message: rpc::ChoiceMessage {
                    content: Some("hello".to_owned()),
                },
            }],
        };
        assert_eq!(extract_reply(ok).unwrap(), "hello");
    }
}
