use crate::analysis::{AiSettings, DEFAULT_ENDPOINT, DEFAULT_MODEL};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "gradebookd", about = "Grade book sidecar (JSON lines over stdio)", version)]
pub struct CliArgs {
    #[arg(
        long,
        env = "GRADEBOOK_WORKSPACE",
        value_name = "DIR",
        help = "Workspace directory to open at start-up"
    )]
    pub workspace: Option<PathBuf>,

    #[arg(
        long,
        env = "GRADEBOOK_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Pretty,
        help = "Log format written to stderr"
    )]
    pub log_format: LogFormat,

    #[arg(
        long,
        env = "GRADEBOOK_AI_ENDPOINT",
        value_name = "URL",
        default_value = DEFAULT_ENDPOINT,
        help = "Base URL of the generative language API"
    )]
    pub ai_endpoint: String,

    #[arg(
        long,
        env = "GRADEBOOK_AI_MODEL",
        value_name = "MODEL",
        default_value = DEFAULT_MODEL
    )]
    pub ai_model: String,

    #[arg(
        long,
        env = "GEMINI_API_KEY",
        value_name = "KEY",
        hide_env_values = true,
        help = "API key; analysis methods report ai_unavailable without it"
    )]
    pub ai_api_key: Option<String>,

    #[arg(
        long,
        env = "GRADEBOOK_AI_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ai_timeout_secs: u64,
}

impl CliArgs {
    pub fn ai_settings(&self) -> AiSettings {
        AiSettings {
            endpoint: self.ai_endpoint.clone(),
            model: self.ai_model.clone(),
            api_key: self.ai_api_key.clone(),
            timeout_secs: self.ai_timeout_secs,
        }
    }
}
