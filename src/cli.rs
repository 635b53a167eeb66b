//! Command-line argument parsing for the copilot server.

use crate::config::{Config, LogFormat};
use crate::error::Result;
use crate::llm::LlmProvider;
use clap::Parser;
use std::path::PathBuf;

/// AI-assisted database copilot server.
#[derive(Parser, Debug, Default)]
#[command(name = "copilot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, value_name = "PATH", env = "COPILOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, value_name = "HOST", env = "COPILOT_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, value_name = "PORT", env = "COPILOT_PORT")]
    pub port: Option<u16>,

    /// LLM provider to use: openai or mock
    #[arg(long, value_name = "PROVIDER", env = "COPILOT_LLM_PROVIDER")]
    pub llm_provider: Option<LlmProvider>,

    /// Log output format: pretty or json
    #[arg(long, value_name = "FORMAT", env = "COPILOT_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path, using the default if not specified.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Loads the config file and applies flag overrides on top.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load_from_file(&self.config_path())?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(provider) = self.llm_provider {
            config.llm.provider = provider.as_str().to_string();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }
}
