use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sl_domain::config::{Config, ConfigSeverity, KnowledgeSourceConfig, SourceKind};
use sl_domain::event::Event;
use sl_pipeline::{AnswerInput, ChatService, Collaborators};
use sl_providers::embedding::RestEmbedding;
use sl_providers::llm::OpenAiCompatLlm;
use sl_providers::rerank::RestRerank;
use sl_providers::search::RestKnowledgeSource;
use sl_providers::stores::{
    MemoryHistory, MemoryResultCache, MemorySemanticCache, StaticSettings,
};
use sl_providers::{KnowledgeSource, RerankProvider};

/// Ask one question through the answer pipeline and stream the result.
#[derive(Parser)]
#[command(name = "sluice", version, about)]
struct Args {
    /// The question to answer.
    question: String,

    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Conversation to continue; a fresh one is started when omitted.
    #[arg(long)]
    conversation: Option<String>,

    /// Print raw NDJSON events instead of rendered output.
    #[arg(long)]
    ndjson: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // ── Config ─────────────────────────────────────────────────────
    let config = load_config(&args.config)?;
    let mut fatal = false;
    for issue in config.validate() {
        match issue.severity {
            ConfigSeverity::Error => {
                tracing::error!(field = %issue.field, "{}", issue.message);
                fatal = true;
            }
            ConfigSeverity::Warning => tracing::warn!(field = %issue.field, "{}", issue.message),
        }
    }
    if fatal {
        anyhow::bail!("configuration invalid, see errors above");
    }
    tracing::info!(
        llm = %config.llm.base_url,
        model = %config.llm.model,
        sources = config.sources.len(),
        "configuration loaded"
    );
    let config = Arc::new(config);

    // ── Collaborators ──────────────────────────────────────────────
    let collab = Arc::new(build_collaborators(&config).await?);

    // ── One turn ───────────────────────────────────────────────────
    let conversation_id = args
        .conversation
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(%conversation_id, "asking");

    let service = ChatService::new(Arc::clone(&config), collab);
    let mut rx = service.stream_answer(AnswerInput {
        conversation_id,
        question: args.question,
    });

    let stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        if args.ndjson {
            writeln!(stdout.lock(), "{}", event.to_ndjson())?;
            continue;
        }
        match event {
            Event::Token { text, .. } => {
                let mut out = stdout.lock();
                write!(out, "{text}")?;
                out.flush()?;
            }
            Event::Step {
                step_type, status, ..
            } => tracing::debug!(?step_type, ?status, "step"),
            Event::ContentBlock { block_type, data } => {
                tracing::info!(%block_type, "content block");
                writeln!(stdout.lock(), "\n{data:#}")?;
            }
            Event::Sources { data } => {
                for source in &data {
                    tracing::info!(id = %source.id, score = source.score, "source");
                }
            }
            Event::Error { message } => tracing::error!("{message}"),
        }
    }
    writeln!(stdout.lock())?;

    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(%path, "config file not found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Wire the REST adapters from the config; stores are in-memory, so a CLI
/// conversation lives for the life of the process.
async fn build_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let llm = Arc::new(OpenAiCompatLlm::from_config(&config.llm)?);
    let embedding = Arc::new(RestEmbedding::from_config(&config.embedding)?);

    let reranker: Option<Arc<dyn RerankProvider>> = match &config.rerank.provider {
        Some(provider) if config.rerank.enabled => Some(Arc::new(RestRerank::from_config(
            provider,
            config.rerank.timeout_ms,
        )?)),
        _ => {
            tracing::info!("no rerank provider configured, stage will be skipped");
            None
        }
    };

    // An empty source list means the implicit default document source,
    // as validation warns.
    let source_cfgs = if config.sources.is_empty() {
        vec![KnowledgeSourceConfig::fallback()]
    } else {
        config.sources.clone()
    };

    let mut sources: Vec<Arc<dyn KnowledgeSource>> = Vec::new();
    for src_cfg in &source_cfgs {
        let mut source =
            RestKnowledgeSource::from_config(src_cfg.clone(), config.retrieval.source_timeout_ms)?;
        if src_cfg.kind == SourceKind::Tabular {
            if let Err(e) = source.load_schema().await {
                tracing::warn!(source = %src_cfg.id, error = %e, "schema fetch failed, source will not take structured queries");
            }
        }
        sources.push(Arc::new(source));
    }

    Ok(Collaborators {
        llm,
        embedding,
        reranker,
        sources,
        history: Arc::new(MemoryHistory::new()),
        semantic_cache: Arc::new(MemorySemanticCache::new(config.cache.min_similarity)),
        result_cache: Arc::new(MemoryResultCache::new()),
        settings: Arc::new(StaticSettings::new(HashMap::new())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_source_list_wires_the_default_source() {
        let config = Config::default();
        assert!(config.sources.is_empty());

        let collab = build_collaborators(&config).await.unwrap();
        assert_eq!(collab.sources.len(), 1);
        assert_eq!(collab.sources[0].id(), "default");
        assert_eq!(collab.sources[0].kind(), SourceKind::Document);
    }

    #[tokio::test]
    async fn configured_sources_are_wired_verbatim() {
        let mut config = Config::default();
        config.sources.push(KnowledgeSourceConfig {
            id: "handbook".into(),
            base_url: "http://localhost:9000".into(),
            ..Default::default()
        });

        let collab = build_collaborators(&config).await.unwrap();
        assert_eq!(collab.sources.len(), 1);
        assert_eq!(collab.sources[0].id(), "handbook");
    }
}
