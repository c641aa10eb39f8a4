//! `openclaw init`: lays out `~/.openclaw/` with a commented `config.toml`,
//! an `agents.json` binding table and the data directory the store opens.
//! Existing files are never touched.

use crate::config::OpenClawConfig;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

struct Template {
    file_name: &'static str,
    body: &'static str,
    check: fn(&str) -> Result<()>,
}

fn check_config(body: &str) -> Result<()> {
    let cfg = OpenClawConfig::from_toml(body).map_err(|e| anyhow::anyhow!("parse config.toml: {e}"))?;
    cfg.validate()
}

fn check_agents(body: &str) -> Result<()> {
    os_llm::AgentBindings::from_json(body)
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("parse agents.json: {e}"))
}

const TEMPLATES: &[Template] = &[
    Template {
        file_name: "config.toml",
        body: include_str!("../../config-templates/config.toml"),
        check: check_config,
    },
    Template {
        file_name: "agents.json",
        body: include_str!("../../config-templates/agents.json"),
        check: check_agents,
    },
];

pub async fn initialize_default() -> Result<InitReport> {
    initialize_at_root(&crate::config::default_config_root()).await
}

#[tracing::instrument(level = "info", skip_all, fields(root = %root.display()))]
pub async fn initialize_at_root(root: &Path) -> Result<InitReport> {
    let data_dir = root.join("data");
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", data_dir.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        data_dir,
        ..InitReport::default()
    };
    for template in TEMPLATES {
        (template.check)(template.body)?;
        let target = root.join(template.file_name);
        if write_new(&target, template.body).await? {
            tracing::info!(path = %target.display(), "wrote template");
            report.created.push(target);
        } else {
            report.skipped.push(target);
        }
    }
    Ok(report)
}

/// Returns false when `path` already exists.
async fn write_new(path: &Path, body: &str) -> Result<bool> {
    let open = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    let mut file = match open {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(anyhow::anyhow!("create {}: {e}", path.display())),
    };
    file.write_all(body.as_bytes())
        .await
        .map_err(|e| anyhow::anyhow!("write {}: {e}", path.display()))?;
    file.flush()
        .await
        .map_err(|e| anyhow::anyhow!("flush {}: {e}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("openclaw-init-{label}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn fresh_root_gets_templates_and_data_dir() {
        let root = scratch("fresh");
        let report = initialize_at_root(&root).await.expect("init");

        assert_eq!(report.created.len(), TEMPLATES.len());
        assert!(report.skipped.is_empty());
        assert!(report.data_dir.is_dir());
        assert!(root.join("config.toml").is_file());
        assert!(root.join("agents.json").is_file());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn existing_files_are_left_alone() {
        let root = scratch("existing");
        std::fs::create_dir_all(&root).expect("root");
        std::fs::write(root.join("config.toml"), "# mine\n").expect("seed");

        let report = initialize_at_root(&root).await.expect("init");
        assert_eq!(report.created, vec![root.join("agents.json")]);
        assert_eq!(report.skipped, vec![root.join("config.toml")]);
        assert_eq!(
            std::fs::read_to_string(root.join("config.toml")).expect("read"),
            "# mine\n"
        );

        let again = initialize_at_root(&root).await.expect("second init");
        assert!(again.created.is_empty());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn bundled_templates_pass_their_checks() {
        for template in TEMPLATES {
            (template.check)(template.body).expect(template.file_name);
        }
        let agents = os_llm::AgentBindings::from_json(TEMPLATES[1].body).expect("agents");
        assert_eq!(agents.binding_count(), 1);
    }
}
