use clap::{Args, Parser, Subcommand, ValueEnum};
use sandbox_lifecycle::{ContainerId, IdleAction, LifecycleConfig, SubscriptionTier};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sandbox-lifecycle")]
#[command(about = "Inspect and drive sandbox container lifecycles")]
pub struct Cli {
    /// Directory holding lifecycle records [default: .sandbox-lifecycle]
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the limits of every subscription tier
    Tiers,
    /// Register a container in STARTING
    Provision {
        /// Generated when omitted
        container_id: Option<ContainerId>,
        #[arg(long)]
        tier: SubscriptionTier,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Mark provisioning complete
    Start { container_id: ContainerId },
    Status { container_id: ContainerId },
    Heartbeat { container_id: ContainerId },
    /// Record API activity on the container
    Touch { container_id: ContainerId },
    Extend {
        container_id: ContainerId,
        #[arg(long, default_value_t = 30)]
        minutes: u32,
    },
    KeepAlive {
        container_id: ContainerId,
        #[arg(value_enum)]
        mode: Toggle,
    },
    Hibernate { container_id: ContainerId },
    Wake { container_id: ContainerId },
    /// Change settings; unspecified fields keep their current value
    Configure {
        container_id: ContainerId,
        #[command(flatten)]
        config: ConfigArgs,
    },
    History { container_id: ContainerId },
    Remove { container_id: ContainerId },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Preset {
    QuickTest,
    Development,
    AgentTask,
    AlwaysOn,
}

impl Preset {
    fn config(self) -> LifecycleConfig {
        match self {
            Preset::QuickTest => LifecycleConfig::quick_test(),
            Preset::Development => LifecycleConfig::development(),
            Preset::AgentTask => LifecycleConfig::agent_task(),
            Preset::AlwaysOn => LifecycleConfig::always_on(),
        }
    }
}

#[derive(Args, Default)]
pub struct ConfigArgs {
    /// Start from a preset instead of the current settings
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,
    /// Idle timeout in minutes
    #[arg(long)]
    pub idle_timeout: Option<u32>,
    /// shutdown, hibernate or keep_alive
    #[arg(long)]
    pub idle_action: Option<IdleAction>,
    /// Lifetime cap in hours
    #[arg(long)]
    pub max_duration: Option<u32>,
    #[arg(long)]
    pub auto_wake: Option<bool>,
    #[arg(long)]
    pub keep_alive_on_preview: Option<bool>,
    /// Heartbeat interval in seconds
    #[arg(long)]
    pub heartbeat_interval: Option<u32>,
}

impl ConfigArgs {
    pub fn is_empty(&self) -> bool {
        self.preset.is_none()
            && self.idle_timeout.is_none()
            && self.idle_action.is_none()
            && self.max_duration.is_none()
            && self.auto_wake.is_none()
            && self.keep_alive_on_preview.is_none()
            && self.heartbeat_interval.is_none()
    }

    /// Overlays the given flags on `base` (or on the preset, when one is named).
    pub fn apply(&self, base: LifecycleConfig) -> LifecycleConfig {
        let mut config = self.preset.map(Preset::config).unwrap_or(base);
        if let Some(minutes) = self.idle_timeout {
            config.idle_timeout_minutes = minutes;
        }
        if let Some(action) = self.idle_action {
            config.idle_action = action;
        }
        if let Some(hours) = self.max_duration {
            config.max_duration_hours = Some(hours);
        }
        if let Some(enabled) = self.auto_wake {
            config.auto_wake = enabled;
        }
        if let Some(enabled) = self.keep_alive_on_preview {
            config.keep_alive_on_preview = enabled;
        }
        if let Some(seconds) = self.heartbeat_interval {
            config.heartbeat_interval_seconds = seconds;
        }
        config
    }
}
