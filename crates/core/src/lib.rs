pub mod agent;
pub mod knowledge;
pub mod llm;
pub mod market;
pub mod session;
pub mod time;
pub mod tools;

pub mod config {
    use anyhow::Context;
    use std::path::{Path, PathBuf};

    use crate::session::PersistPolicy;

    const DEFAULT_HISTORY_DIR: &str = "chat_history";
    /// Secrets file consulted after `.env`; overridable with `FINAGENT_ENV_FILE`.
    pub const DEFAULT_ENV_FILE: &str = "configs/.env";

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub tushare_token: Option<String>,
        pub tushare_base_url: Option<String>,
        pub ark_api_key: Option<String>,
        pub ark_base_url: Option<String>,
        pub ark_model_id: Option<String>,
        pub ark_title_model_id: Option<String>,
        pub ark_embedding_model_id: Option<String>,
        pub knowledge_base_csv: Option<PathBuf>,
        pub history_dir: PathBuf,
        pub persist_policy: PersistPolicy,
        pub stooq_enabled: bool,
        pub sentry_dsn: Option<String>,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                tushare_token: None,
                tushare_base_url: None,
                ark_api_key: None,
                ark_base_url: None,
                ark_model_id: None,
                ark_title_model_id: None,
                ark_embedding_model_id: None,
                knowledge_base_csv: None,
                history_dir: PathBuf::from(DEFAULT_HISTORY_DIR),
                persist_policy: PersistPolicy::default(),
                stooq_enabled: true,
                sentry_dsn: None,
            }
        }
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let persist_policy = match std::env::var("SESSION_PERSIST_POLICY") {
                Ok(s) => s.parse::<PersistPolicy>()?,
                Err(_) => PersistPolicy::default(),
            };

            Ok(Self {
                tushare_token: non_empty_var("TUSHARE_TOKEN"),
                tushare_base_url: non_empty_var("TUSHARE_BASE_URL"),
                ark_api_key: non_empty_var("ARK_API_KEY"),
                ark_base_url: non_empty_var("ARK_BASE_URL"),
                ark_model_id: non_empty_var("ARK_MODEL_ID"),
                ark_title_model_id: non_empty_var("ARK_TITLE_MODEL_ID"),
                ark_embedding_model_id: non_empty_var("ARK_EMBEDDING_MODEL_ID"),
                knowledge_base_csv: non_empty_var("KNOWLEDGE_BASE_CSV").map(PathBuf::from),
                history_dir: non_empty_var("CHAT_HISTORY_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_DIR)),
                persist_policy,
                stooq_enabled: parse_flag(std::env::var("STOOQ_ENABLED").ok(), true),
                sentry_dsn: non_empty_var("SENTRY_DSN"),
            })
        }

        pub fn require_ark_api_key(&self) -> anyhow::Result<&str> {
            self.ark_api_key
                .as_deref()
                .context("ARK_API_KEY is required")
        }

        pub fn require_ark_model_id(&self) -> anyhow::Result<&str> {
            self.ark_model_id
                .as_deref()
                .context("ARK_MODEL_ID is required")
        }

        pub fn require_ark_embedding_model_id(&self) -> anyhow::Result<&str> {
            self.ark_embedding_model_id
                .as_deref()
                .context("ARK_EMBEDDING_MODEL_ID is required")
        }

        pub fn require_knowledge_base_csv(&self) -> anyhow::Result<&Path> {
            self.knowledge_base_csv
                .as_deref()
                .context("KNOWLEDGE_BASE_CSV is required")
        }
    }

    fn non_empty_var(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse_flag(v: Option<String>, default: bool) -> bool {
        let Some(v) = v else {
            return default;
        };
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        }
    }

}
