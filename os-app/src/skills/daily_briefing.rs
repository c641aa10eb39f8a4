use super::{Skill, SkillContext, SkillResponse};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use os_llm::{ChatRequest, InferenceRouter, ProviderKind};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const NOTION_API_BASE: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
/// Briefing contexts longer than this go to the cloud tier.
const LONG_CONTEXT_CHARS: usize = 1_000;

#[derive(Debug, Clone, Default)]
pub struct NotionDatabases {
    pub calendar: Option<String>,
    pub tasks: Option<String>,
    pub projects: Option<String>,
}

/// One Notion row flattened to its title and lowercase property names.
#[derive(Debug, Clone, Default, PartialEq)]
struct NotionItem {
    title: String,
    fields: BTreeMap<String, String>,
}

impl NotionItem {
    fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

fn parse_page(page: &Value) -> NotionItem {
    let mut item = NotionItem::default();
    let Some(props) = page.get("properties").and_then(Value::as_object) else {
        return item;
    };
    for (key, prop) in props {
        let key = key.to_lowercase();
        match prop.get("type").and_then(Value::as_str) {
            Some("title") => {
                item.title = prop
                    .pointer("/title/0/plain_text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
            }
            Some("date") => {
                if let Some(start) = prop.pointer("/date/start").and_then(Value::as_str) {
                    item.fields.insert(key, start.to_string());
                }
            }
            Some(kind @ ("select" | "status")) => {
                if let Some(name) = prop.get(kind).and_then(|v| v.get("name")).and_then(Value::as_str) {
                    item.fields.insert(key, name.to_string());
                }
            }
            Some("number") => {
                if let Some(n) = prop.get("number").filter(|v| !v.is_null()) {
                    item.fields.insert(key, n.to_string());
                }
            }
            _ => {}
        }
    }
    item
}

#[derive(Clone)]
struct NotionClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl NotionClient {
    fn new(token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: NOTION_API_BASE.to_string(),
            token: token.to_string(),
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(database_id = %database_id))]
    async fn query(&self, database_id: &str, payload: Value) -> Result<Vec<NotionItem>> {
        let response = self
            .http
            .post(format!("{}/databases/{database_id}/query", self.base_url))
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("notion query failed: status={status} body={body}"));
        }
        let parsed: Value = serde_json::from_str(&body)?;
        Ok(parsed
            .get("results")
            .and_then(Value::as_array)
            .map(|pages| pages.iter().map(parse_page).collect())
            .unwrap_or_default())
    }

    /// Failures are logged and read as an empty section.
    async fn query_or_empty(&self, database_id: Option<&str>, payload: Value) -> Vec<NotionItem> {
        let Some(database_id) = database_id.filter(|id| !id.is_empty()) else {
            return Vec::new();
        };
        match self.query(database_id, payload).await {
            Ok(items) => items,
            Err(error) => {
                tracing::warn!(%error, database_id, "notion query failed");
                Vec::new()
            }
        }
    }
}

/// Calendar, open tasks and active projects from Notion, summarized by the
/// router. Without a Notion token the model writes a generic briefing.
pub struct DailyBriefingSkill {
    router: Arc<InferenceRouter>,
    notion: Option<NotionClient>,
    databases: NotionDatabases,
    assistant_name: String,
}

impl DailyBriefingSkill {
    pub fn new(
        router: Arc<InferenceRouter>,
        notion_token: Option<&str>,
        databases: NotionDatabases,
        assistant_name: &str,
    ) -> Result<Self> {
        let notion = match notion_token.filter(|t| !t.trim().is_empty()) {
            Some(token) => Some(NotionClient::new(token)?),
            None => None,
        };
        Ok(Self {
            router,
            notion,
            databases,
            assistant_name: assistant_name.to_string(),
        })
    }

    async fn generic_briefing(&self, ctx: &SkillContext, today: &str) -> Result<SkillResponse> {
        let req = ChatRequest::prompt(format!(
            "Today is {today}. Give me a brief, motivating morning briefing. Include the \
             day/date, and suggest a productive structure for the day."
        ))
        .with_system(format!(
            "You are {}, a personal assistant. Be concise and encouraging.",
            self.assistant_name
        ))
        .with_sender(ctx.sender());
        let completion = self.router.chat(&req).await?;
        Ok(SkillResponse::reply(completion.text))
    }
}

fn format_day<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%A, %B %d, %Y").to_string()
}

fn build_context(
    calendar: &[NotionItem],
    tasks: &[NotionItem],
    projects: &[NotionItem],
    today: &str,
) -> String {
    let title = |item: &NotionItem| {
        if item.title.is_empty() {
            "Untitled".to_string()
        } else {
            item.title.clone()
        }
    };
    let mut sections = vec![format!("Today is {today}\n")];
    if !calendar.is_empty() {
        sections.push("## Calendar Events".to_string());
        for event in calendar {
            let date = event.field("date").or(event.field("due")).unwrap_or("");
            sections.push(format!("- {} ({date})", title(event)));
        }
    }
    if !tasks.is_empty() {
        sections.push("\n## Tasks".to_string());
        for task in tasks {
            let prefix = task
                .field("priority")
                .map(|p| format!("[{p}] "))
                .unwrap_or_default();
            sections.push(format!(
                "- {prefix}{} ({}, due: {})",
                title(task),
                task.field("status").unwrap_or(""),
                task.field("due").unwrap_or("no due date")
            ));
        }
    }
    if !projects.is_empty() {
        sections.push("\n## Active Projects".to_string());
        for project in projects {
            sections.push(format!(
                "- {}, deadline: {}",
                title(project),
                project.field("deadline").unwrap_or("no deadline")
            ));
        }
    }
    sections.join("\n")
}

fn fallback_briefing(calendar: &[NotionItem], tasks: &[NotionItem], today: &str) -> String {
    let mut lines = vec![format!("**Daily Briefing: {today}**\n")];
    if calendar.is_empty() {
        lines.push("**Schedule:** No events today.".to_string());
    } else {
        lines.push("**Schedule:**".to_string());
        for event in calendar.iter().take(5) {
            lines.push(format!(
                "  - {} ({})",
                event.title,
                event.field("date").unwrap_or("?")
            ));
        }
    }
    if tasks.is_empty() {
        lines.push("\n**Tasks:** All clear!".to_string());
    } else {
        lines.push("\n**Tasks:**".to_string());
        for task in tasks.iter().take(5) {
            lines.push(format!("  - {}", task.title));
        }
    }
    lines.push("\nHave a productive day!".to_string());
    lines.join("\n")
}

#[async_trait]
impl Skill for DailyBriefingSkill {
    fn name(&self) -> &'static str {
        "daily_briefing"
    }

    fn description(&self) -> &'static str {
        "Daily briefing with calendar, tasks, and schedule"
    }

    fn min_tier(&self) -> u8 {
        0
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "daily briefing",
            "what's on my calendar",
            "what's on for today",
        ]
    }

    #[tracing::instrument(level = "info", skip_all, fields(notion = self.notion.is_some()))]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let now = Local::now();
        let today = format_day(&now);
        let Some(notion) = &self.notion else {
            return self.generic_briefing(ctx, &today).await;
        };

        let date = now.format("%Y-%m-%d").to_string();
        let (calendar, tasks, projects) = tokio::join!(
            notion.query_or_empty(
                self.databases.calendar.as_deref(),
                json!({
                    "filter": { "property": "Date", "date": { "on_or_after": date } },
                    "sorts": [{ "property": "Date", "direction": "ascending" }],
                    "page_size": 20,
                }),
            ),
            notion.query_or_empty(
                self.databases.tasks.as_deref(),
                json!({
                    "filter": { "property": "Status", "status": { "does_not_equal": "Done" } },
                    "sorts": [{ "property": "Due", "direction": "ascending" }],
                    "page_size": 20,
                }),
            ),
            notion.query_or_empty(
                self.databases.projects.as_deref(),
                json!({
                    "filter": { "property": "Status", "status": { "does_not_equal": "Completed" } },
                    "sorts": [{ "property": "Deadline", "direction": "ascending" }],
                    "page_size": 10,
                }),
            ),
        );

        let context = build_context(&calendar, &tasks, &projects, &today);
        let mut req = ChatRequest::prompt(format!(
            "Based on the following data, create a concise daily briefing for today ({today}).\n\n\
             {context}\n\n\
             Format the briefing with sections: Schedule, Priority Tasks, Active Projects, and a \
             brief motivational note. Keep it concise and actionable."
        ))
        .with_system(format!(
            "You are {} creating a morning briefing. Be concise, structured, and actionable.",
            self.assistant_name
        ))
        .with_sender(ctx.sender());
        if context.len() > LONG_CONTEXT_CHARS {
            req = req.with_provider(ProviderKind::OpenRouter);
        }

        match self.router.chat(&req).await {
            Ok(completion) => Ok(SkillResponse::reply(completion.text)),
            Err(error) => {
                tracing::warn!(%error, "briefing generation failed; using plain layout");
                Ok(SkillResponse::reply(fallback_briefing(&calendar, &tasks, &today)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(title: &str, fields: &[(&str, &str)]) -> NotionItem {
        NotionItem {
            title: title.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn pages_flatten_to_lowercase_fields() {
        let page = json!({
            "id": "p1",
            "properties": {
                "Name": { "type": "title", "title": [{ "plain_text": "Dentist" }] },
                "Date": { "type": "date", "date": { "start": "2026-03-02" } },
                "Priority": { "type": "select", "select": { "name": "High" } },
                "Status": { "type": "status", "status": { "name": "Todo" } },
                "Points": { "type": "number", "number": 3 },
                "Empty": { "type": "select", "select": null }
            }
        });
        let parsed = parse_page(&page);
        assert_eq!(parsed.title, "Dentist");
        assert_eq!(parsed.field("date"), Some("2026-03-02"));
        assert_eq!(parsed.field("priority"), Some("High"));
        assert_eq!(parsed.field("status"), Some("Todo"));
        assert_eq!(parsed.field("points"), Some("3"));
        assert_eq!(parsed.field("empty"), None);
    }

    #[test]
    fn context_lists_each_section() {
        let ctx = build_context(
            &[item("Standup", &[("date", "2026-03-02T09:00")])],
            &[item("Taxes", &[("priority", "High"), ("status", "Todo")])],
            &[item("", &[])],
            "Monday, March 02, 2026",
        );
        assert!(ctx.starts_with("Today is Monday, March 02, 2026"));
        assert!(ctx.contains("- Standup (2026-03-02T09:00)"));
        assert!(ctx.contains("- [High] Taxes (Todo, due: no due date)"));
        assert!(ctx.contains("- Untitled, deadline: no deadline"));
    }

    #[test]
    fn fallback_reports_empty_sections() {
        let text = fallback_briefing(&[], &[], "Monday");
        assert!(text.contains("No events today."));
        assert!(text.contains("All clear!"));
    }

    #[test]
    fn day_format_is_long_form() {
        let day = Utc
            .with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
            .single()
            .expect("valid timestamp");
        assert_eq!(format_day(&day), "Monday, March 02, 2026");
    }
}
