use super::args::{Command, Toggle};
use anyhow::{Context, Result, bail};
use futures::future::try_join_all;
use sandbox_lifecycle::{
    Capability, ContainerId, EngineConfig, LifecycleConfig, LifecycleController, StaticTierPolicy,
    SubscriptionTier, TierPolicy,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

pub const DEFAULT_STORE_DIR: &str = ".sandbox-lifecycle";

pub struct App {
    controller: LifecycleController,
}

impl App {
    /// Opens the file store and reloads every container in it.
    pub async fn open(store: Option<&Path>, config: Option<&Path>) -> Result<Self> {
        let mut engine = match config {
            Some(path) => EngineConfig::from_json_file(path)
                .with_context(|| format!("Failed to load engine config '{}'", path.display()))?,
            None => EngineConfig::default(),
        };
        let store_dir = store
            .map(Path::to_path_buf)
            .or_else(|| engine.store_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
        engine = engine.store_dir(&store_dir);

        let controller = LifecycleController::open(engine)
            .await
            .with_context(|| format!("Failed to open lifecycle store '{}'", store_dir.display()))?;
        Ok(Self { controller })
    }

    pub async fn run(&self, command: Command) -> Result<Value> {
        let controller = &self.controller;
        let output = match command {
            Command::Tiers => tiers(),
            Command::Provision {
                container_id,
                tier,
                config,
            } => {
                let container_id = container_id.unwrap_or_else(ContainerId::generate);
                let config = if config.is_empty() {
                    None
                } else {
                    Some(config.apply(LifecycleConfig::default()))
                };
                serde_json::to_value(controller.provision(container_id, tier, config).await?)?
            }
            Command::Start { container_id } => {
                serde_json::to_value(controller.mark_running(&container_id).await?)?
            }
            Command::Status { container_id } => {
                serde_json::to_value(controller.get_status(&container_id).await?)?
            }
            Command::Heartbeat { container_id } => {
                serde_json::to_value(controller.heartbeat(&container_id).await?)?
            }
            Command::Touch { container_id } => {
                serde_json::to_value(controller.touch(&container_id).await?)?
            }
            Command::Extend {
                container_id,
                minutes,
            } => serde_json::to_value(
                controller
                    .extend_timeout(&container_id, minutes)
                    .await?,
            )?,
            Command::KeepAlive { container_id, mode } => serde_json::to_value(
                controller
                    .set_keep_alive(&container_id, matches!(mode, Toggle::On))
                    .await?,
            )?,
            Command::Hibernate { container_id } => {
                serde_json::to_value(controller.hibernate(&container_id).await?)?
            }
            Command::Wake { container_id } => {
                serde_json::to_value(controller.wake(&container_id).await?)?
            }
            Command::Configure {
                container_id,
                config,
            } => {
                if config.is_empty() {
                    bail!("configure needs at least one setting");
                }
                let current = controller.get_config(&container_id).await?;
                serde_json::to_value(
                    controller
                        .configure(&container_id, config.apply(current))
                        .await?,
                )?
            }
            Command::History { container_id } => {
                serde_json::to_value(controller.history(&container_id).await?)?
            }
            Command::Remove { container_id } => {
                controller.remove(&container_id).await?;
                json!({ "container_id": container_id, "removed": true })
            }
            Command::List => {
                let ids = controller.container_ids().await;
                let statuses =
                    try_join_all(ids.iter().map(|id| controller.get_status(id))).await?;
                serde_json::to_value(statuses)?
            }
        };
        Ok(output)
    }

    pub async fn shutdown(self) -> Result<()> {
        self.controller
            .shutdown()
            .await
            .context("Failed to stop timer dispatcher")
    }
}

fn tiers() -> Value {
    let policy = StaticTierPolicy::global();
    let rows: Vec<Value> = SubscriptionTier::ALL
        .into_iter()
        .map(|tier| {
            let limits = policy.limits(tier);
            json!({
                "tier": tier,
                "max_idle_timeout_minutes": limits.max_idle_timeout_minutes(),
                "max_extensions": limits.max_extensions,
                "supports_hibernate": limits.supports_hibernate,
                "supports_keep_alive": limits.supports_keep_alive,
                "max_duration_hours": limits.max_duration.map(|d| d.as_secs() / 3600),
            })
        })
        .collect();
    json!({
        "tiers": rows,
        "hibernate_requires": policy.required_tier(Capability::Hibernate),
        "keep_alive_requires": policy.required_tier(Capability::KeepAlive),
    })
}
