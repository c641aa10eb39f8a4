use super::{Skill, SkillContext, SkillResponse};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use os_llm::InferenceRouter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const CUSTOM_SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";
const RESULT_COUNT: &str = "5";
const NOT_CONFIGURED_NOTE: &str =
    "\n\n_Note: Web search is not configured. This answer is from my training data._";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

struct CustomSearch {
    http: reqwest::Client,
    api_key: String,
    engine_id: String,
}

impl CustomSearch {
    #[tracing::instrument(level = "info", skip_all, fields(query_len = query.len()))]
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let response = self
            .http
            .get(CUSTOM_SEARCH_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query),
                ("num", RESULT_COUNT),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("custom search failed: status={status} body={body}"));
        }
        let parsed: SearchResponse = serde_json::from_str(&body)?;
        Ok(parsed.items)
    }
}

/// Google Custom Search with an LLM summary. Falls back to the model's own
/// knowledge when search is unconfigured or returns nothing.
pub struct WebSearchSkill {
    router: Arc<InferenceRouter>,
    search: Option<CustomSearch>,
    assistant_name: String,
}

impl WebSearchSkill {
    pub fn new(
        router: Arc<InferenceRouter>,
        api_key: Option<&str>,
        engine_id: Option<&str>,
        assistant_name: &str,
    ) -> Result<Self> {
        let search = match (
            api_key.filter(|k| !k.trim().is_empty()),
            engine_id.filter(|e| !e.trim().is_empty()),
        ) {
            (Some(api_key), Some(engine_id)) => Some(CustomSearch {
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()?,
                api_key: api_key.to_string(),
                engine_id: engine_id.to_string(),
            }),
            _ => None,
        };
        Ok(Self {
            router,
            search,
            assistant_name: assistant_name.to_string(),
        })
    }

    async fn answer_from_model(&self, query: &str) -> Result<SkillResponse> {
        let completion = self
            .router
            .generate(
                &format!("Answer this question concisely: {query}"),
                Some(&format!(
                    "You are {}. Answer questions directly and concisely. If you're not sure, say so.",
                    self.assistant_name
                )),
                None,
                os_llm::DEFAULT_TEMPERATURE,
            )
            .await?;
        let mut text = completion.text;
        if self.search.is_none() {
            text.push_str(NOT_CONFIGURED_NOTE);
        }
        Ok(SkillResponse::reply(text))
    }
}

fn extract_query(ctx: &SkillContext) -> String {
    if let Some(query) = ctx.matched.entity("query") {
        return query.trim().to_string();
    }
    let text = ctx.text().trim();
    let lower = text.to_lowercase();
    for prefix in [
        "search for",
        "search",
        "look up",
        "google",
        "find info about",
        "find information on",
    ] {
        if lower.starts_with(prefix) {
            return text.get(prefix.len()..).unwrap_or("").trim().to_string();
        }
    }
    text.to_string()
}

fn render_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| format!("**{}**\n{}\nSource: {}", r.title, r.snippet, r.link))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Skill for WebSearchSkill {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web and summarize results"
    }

    fn min_tier(&self) -> u8 {
        0
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "search for Python FastAPI tutorial",
            "look up latest news about AI",
            "google best pizza recipe",
        ]
    }

    #[tracing::instrument(level = "info", skip_all, fields(configured = self.search.is_some()))]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let query = extract_query(ctx);
        if query.is_empty() {
            return Ok(SkillResponse::error("What would you like me to search for?"));
        }
        let Some(search) = &self.search else {
            return self.answer_from_model(&query).await;
        };

        let results = match search.search(&query).await {
            Ok(results) => results,
            Err(error) => {
                tracing::warn!(%error, "web search failed");
                Vec::new()
            }
        };
        if results.is_empty() {
            return self.answer_from_model(&query).await;
        }

        let rendered = render_results(&results);
        let prompt = format!(
            "The user asked: \"{query}\"\n\nHere are the search results:\n\n{rendered}\n\n\
             Provide a concise, informative answer based on these results. Cite sources where relevant."
        );
        match self
            .router
            .generate(
                &prompt,
                Some("Summarize search results concisely. Cite sources with URLs."),
                None,
                os_llm::DEFAULT_TEMPERATURE,
            )
            .await
        {
            Ok(completion) => Ok(SkillResponse::reply(completion.text)),
            Err(error) => {
                tracing::warn!(%error, "search summary failed; returning raw results");
                Ok(SkillResponse::reply(rendered))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{SkillMatch, classify};
    use crate::testing::local_router;
    use os_channels::{Channel, InboundMessage};

    fn ctx(text: &str, matched: SkillMatch) -> SkillContext {
        SkillContext {
            message: InboundMessage::text(Channel::Api, "u1", text),
            matched,
            user_tier: 0,
            history: Vec::new(),
            memories: Vec::new(),
        }
    }

    #[test]
    fn query_comes_from_entities_then_prefixes() {
        let text = "search for rust async book";
        assert_eq!(extract_query(&ctx(text, classify(text, &[]))), "rust async book");
        assert_eq!(
            extract_query(&ctx("Look up Tokio docs", SkillMatch::new("web_search", 0.7))),
            "Tokio docs"
        );
        assert_eq!(
            extract_query(&ctx("who wrote dune", SkillMatch::new("web_search", 0.7))),
            "who wrote dune"
        );
    }

    #[test]
    fn results_render_with_sources() {
        let out = render_results(&[SearchResult {
            title: "Tokio".to_string(),
            snippet: "async runtime".to_string(),
            link: "https://tokio.rs".to_string(),
        }]);
        assert_eq!(out, "**Tokio**\nasync runtime\nSource: https://tokio.rs");
    }

    #[tokio::test]
    async fn unconfigured_search_answers_from_model_with_note() {
        let skill = WebSearchSkill::new(Arc::new(local_router("Frank Herbert")), None, None, "Jarvis")
            .expect("skill");
        let out = skill
            .execute(&ctx("who wrote dune", SkillMatch::new("web_search", 0.7)))
            .await
            .expect("execute");
        assert!(out.text.starts_with("Frank Herbert"));
        assert!(out.text.ends_with(NOT_CONFIGURED_NOTE));
    }
}
