use super::{Skill, SkillContext, SkillResponse};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use std::time::Duration;

static LEADING_THE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^the\s+").expect("valid device regex"));
static TRAILING_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+to\s+.*$").expect("valid device regex"));
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid number regex"));

#[derive(Debug, Clone, Deserialize)]
struct EntityState {
    entity_id: String,
    #[serde(default)]
    attributes: Value,
}

impl EntityState {
    fn friendly_name(&self) -> Option<&str> {
        self.attributes.get("friendly_name").and_then(Value::as_str)
    }

    fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ServiceCall {
    domain: String,
    service: &'static str,
    data: Map<String, Value>,
}

impl ServiceCall {
    fn new(domain: &str, service: &'static str) -> Self {
        Self {
            domain: domain.to_string(),
            service,
            data: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Domain-specific service for `action` on an entity, with a generic
/// on/off fallback.
fn resolve_service(domain: &str, action: &str, value: &str) -> Option<ServiceCall> {
    let on = matches!(action, "on" | "turn on");
    let off = matches!(action, "off" | "turn off");
    let numeric = value.parse::<u64>().ok();

    match domain {
        "light" if on => {
            let call = ServiceCall::new("light", "turn_on");
            return Some(match numeric {
                Some(pct) => call.with("brightness_pct", json!(pct)),
                None => call,
            });
        }
        "light" if off => return Some(ServiceCall::new("light", "turn_off")),
        "light" if matches!(action, "dim" | "brighten") => {
            let pct = numeric.unwrap_or(if action == "dim" { 30 } else { 100 });
            return Some(ServiceCall::new("light", "turn_on").with("brightness_pct", json!(pct)));
        }
        "switch" if on => return Some(ServiceCall::new("switch", "turn_on")),
        "switch" if off => return Some(ServiceCall::new("switch", "turn_off")),
        "climate" => {
            if let Some(temp) = NUMBER.find(value).and_then(|m| m.as_str().parse::<u64>().ok()) {
                return Some(
                    ServiceCall::new("climate", "set_temperature").with("temperature", json!(temp)),
                );
            }
        }
        "lock" if action == "lock" => return Some(ServiceCall::new("lock", "lock")),
        "lock" if action == "unlock" => return Some(ServiceCall::new("lock", "unlock")),
        "fan" if on || action == "open" => return Some(ServiceCall::new("fan", "turn_on")),
        "fan" if off || action == "close" => return Some(ServiceCall::new("fan", "turn_off")),
        "cover" if on || action == "open" => return Some(ServiceCall::new("cover", "open_cover")),
        "cover" if off || action == "close" => {
            return Some(ServiceCall::new("cover", "close_cover"));
        }
        _ => {}
    }

    if on {
        Some(ServiceCall::new("homeassistant", "turn_on"))
    } else if off {
        Some(ServiceCall::new("homeassistant", "turn_off"))
    } else {
        None
    }
}

/// An entity id containing the device wins outright; otherwise the friendly
/// name sharing the most words.
fn find_entity<'a>(states: &'a [EntityState], device: &str) -> Option<&'a EntityState> {
    let device = device.to_lowercase();
    let underscored = device.replace(' ', "_");
    let words: Vec<&str> = device.split_whitespace().collect();

    let mut best: Option<(&EntityState, usize)> = None;
    for state in states {
        if state.entity_id.to_lowercase().contains(&underscored) {
            return Some(state);
        }
        let friendly = state.friendly_name().unwrap_or_default().to_lowercase();
        let score = words.iter().filter(|w| friendly.contains(**w)).count();
        if score > best.map_or(0, |(_, s)| s) {
            best = Some((state, score));
        }
    }
    best.map(|(state, _)| state)
}

fn extract_device(text: &str) -> String {
    let text = text.to_lowercase();
    for prefix in ["turn on", "turn off", "dim", "brighten", "set", "lock", "unlock"] {
        if let Some((_, after)) = text.split_once(prefix) {
            let after = LEADING_THE.replace(after.trim(), "");
            return TRAILING_TO.replace(&after, "").trim().to_string();
        }
    }
    String::new()
}

struct HomeAssistantClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HomeAssistantClient {
    async fn states(&self) -> Result<Vec<EntityState>> {
        let response = self
            .http
            .get(format!("{}/api/states", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("home assistant states failed: status={status} body={body}"));
        }
        Ok(serde_json::from_str(&body)?)
    }

    #[tracing::instrument(level = "info", skip_all, fields(domain = %call.domain, service = call.service, entity_id = %entity_id))]
    async fn call(&self, call: &ServiceCall, entity_id: &str) -> Result<()> {
        let mut payload = call.data.clone();
        payload.insert("entity_id".to_string(), json!(entity_id));
        let response = self
            .http
            .post(format!(
                "{}/api/services/{}/{}",
                self.base_url, call.domain, call.service
            ))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("home assistant service failed: status={status} body={body}"));
        }
        Ok(())
    }
}

/// Home Assistant entity lookup and service calls.
pub struct SmartHomeSkill {
    client: Option<HomeAssistantClient>,
}

impl SmartHomeSkill {
    pub fn new(base_url: Option<&str>, token: Option<&str>) -> Result<Self> {
        let base_url = base_url.map(|u| u.trim().trim_end_matches('/')).filter(|u| !u.is_empty());
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let client = match (base_url, token) {
            (Some(base_url), Some(token)) => Some(HomeAssistantClient {
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()?,
                base_url: base_url.to_string(),
                token: token.to_string(),
            }),
            _ => None,
        };
        Ok(Self { client })
    }
}

#[async_trait]
impl Skill for SmartHomeSkill {
    fn name(&self) -> &'static str {
        "smart_home"
    }

    fn description(&self) -> &'static str {
        "Control smart home devices via Home Assistant"
    }

    fn min_tier(&self) -> u8 {
        1
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "turn on the living room lights",
            "set thermostat to 72",
            "lock the front door",
        ]
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let Some(client) = &self.client else {
            return Ok(SkillResponse::error(
                "Home Assistant is not configured. Set HOME_ASSISTANT_URL and HOME_ASSISTANT_TOKEN.",
            ));
        };

        let action = ctx.matched.entity("action").unwrap_or_default().to_lowercase();
        let value = ctx.matched.entity("value").unwrap_or_default().to_string();
        let device = match ctx.matched.entity("device") {
            Some(device) => device.to_lowercase(),
            None => extract_device(ctx.text()),
        };
        if device.is_empty() {
            return Ok(SkillResponse::error(
                "What device do you want to control? \
                 Try: 'turn on living room lights', 'set thermostat to 72'",
            ));
        }

        let states = match client.states().await {
            Ok(states) => states,
            Err(error) => {
                tracing::warn!(%error, "failed to load home assistant states");
                Vec::new()
            }
        };
        let Some(entity) = find_entity(&states, &device) else {
            return Ok(SkillResponse::error(format!(
                "I couldn't find a device matching '{device}'."
            )));
        };
        let domain = entity.domain();
        let Some(call) = resolve_service(domain, &action, &value) else {
            return Ok(SkillResponse::error(format!(
                "I don't know how to '{action}' a {domain} device."
            )));
        };

        match client.call(&call, &entity.entity_id).await {
            Ok(()) => {
                let friendly = entity.friendly_name().unwrap_or(&device);
                Ok(SkillResponse::reply(
                    format!("Done: {friendly}: {action} {value}").trim().to_string(),
                ))
            }
            Err(error) => {
                tracing::warn!(%error, entity_id = %entity.entity_id, "service call failed");
                Ok(SkillResponse::error(format!("Failed to {action} {device}.")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(entity_id: &str, friendly: &str) -> EntityState {
        EntityState {
            entity_id: entity_id.to_string(),
            attributes: json!({ "friendly_name": friendly }),
        }
    }

    #[test]
    fn entity_id_match_beats_friendly_names() {
        let states = vec![
            state("light.kitchen_main", "Living Room Lamp"),
            state("light.living_room", "Living Room Ceiling"),
        ];
        let found = find_entity(&states, "living room").expect("match");
        assert_eq!(found.entity_id, "light.living_room");

        let found = find_entity(&states, "lamp").expect("friendly match");
        assert_eq!(found.entity_id, "light.kitchen_main");
        assert!(find_entity(&states, "garage").is_none());
    }

    #[test]
    fn services_follow_domain_rules() {
        let call = resolve_service("light", "dim", "").expect("dim");
        assert_eq!(call.service, "turn_on");
        assert_eq!(call.data["brightness_pct"], json!(30));

        let call = resolve_service("climate", "", "72 degrees").expect("climate");
        assert_eq!(call.service, "set_temperature");
        assert_eq!(call.data["temperature"], json!(72));

        assert_eq!(
            resolve_service("cover", "close", "").map(|c| c.service),
            Some("close_cover")
        );
        assert_eq!(
            resolve_service("media_player", "on", "").map(|c| c.domain),
            Some("homeassistant".to_string())
        );
        assert!(resolve_service("sensor", "dim", "").is_none());
    }

    #[test]
    fn device_is_pulled_from_free_text() {
        assert_eq!(extract_device("Set the thermostat to 70"), "thermostat");
        assert_eq!(extract_device("please turn on porch light"), "porch light");
        assert_eq!(extract_device("hello"), "");
    }

    #[tokio::test]
    async fn unconfigured_home_assistant_is_reported() {
        let skill = SmartHomeSkill::new(None, Some("token")).expect("skill");
        let ctx = SkillContext {
            message: os_channels::InboundMessage::text(os_channels::Channel::Api, "u1", "turn on lamp"),
            matched: crate::intent::SkillMatch::new("smart_home", 0.95),
            user_tier: 1,
            history: Vec::new(),
            memories: Vec::new(),
        };
        let out = skill.execute(&ctx).await.expect("execute");
        assert!(out.text.starts_with("Home Assistant is not configured"));
    }
}
