use crate::config::{AppConfig, TemplateOptions};
use config::{Config, File};
use eventnative_core::{CounterReporter, ErrorReporter, TemplateRegistry};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

/// Errors that can occur during application execution.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Template(#[from] eventnative_core::Error),
    /// Reading events or writing results failed.
    #[error("IO operation failed: {source}")]
    IO {
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid path")]
    InvalidPath,
}

/// What a run processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Input lines that parsed as events.
    pub events: u64,
    /// Errors observed, keyed by classification.
    pub errors: BTreeMap<String, u64>,
}

/// Reads newline-delimited events and writes one result line per template
/// and event.
pub struct App {
    /// Global application configuration.
    pub config: AppConfig,
}

impl App {
    /// Registers every configured template, then streams `input` through all
    /// of them until EOF. Templates that fail to register are logged and
    /// skipped.
    #[tracing::instrument(skip_all, name = "app")]
    pub async fn run<R, W>(self, input: R, mut output: W) -> Result<RunSummary, Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let templates = load_templates(&self.config)?;
        let counter = Arc::new(CounterReporter::new());
        let registry = TemplateRegistry::new(
            Arc::new(self.config.executor.clone()),
            counter.clone(),
        );

        for template in &templates {
            let executor_config = Arc::new(template.executor_config(&self.config.executor));
            if let Err(err) = registry
                .register_with(&template.name, &template.expression, executor_config)
                .await
            {
                error!(template = %template.name, %err, "template registration failed, skipping");
            }
        }
        if registry.is_empty() {
            warn!("no templates registered");
        }
        let names = registry.names();

        let mut events = 0;
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.map_err(|source| Error::IO { source })? {
            if line.trim().is_empty() {
                continue;
            }
            let event = match eventnative_core::event::from_str(&line) {
                Ok(event) => event,
                Err(err) => {
                    counter.report(err.kind());
                    write_line(&mut output, &json!({"error": err.to_string(), "error_type": err.kind()})).await?;
                    continue;
                }
            };
            events += 1;

            let results = futures_util::future::join_all(
                names.iter().map(|name| registry.process(name, &event)),
            )
            .await;
            for (name, result) in names.iter().zip(results) {
                let record = match result {
                    Ok(value) => json!({"template": name, "result": value}),
                    Err(err) => json!({"template": name, "error": err.to_string(), "error_type": err.kind()}),
                };
                write_line(&mut output, &record).await?;
            }
        }
        output.flush().await.map_err(|source| Error::IO { source })?;

        if let Err(err) = registry.close_all().await {
            warn!(%err, "closing templates failed");
        }
        let errors = counter.snapshot();
        info!(events, metric = %counter.metric_name(), ?errors, "input exhausted");
        Ok(RunSummary { events, errors })
    }
}

/// Inline templates followed by the ones found through `templates_dir`.
fn load_templates(config: &AppConfig) -> Result<Vec<TemplateOptions>, Error> {
    let mut templates = config.templates.clone();
    let Some(dir) = &config.templates_dir else {
        return Ok(templates);
    };
    let pattern = dir.to_str().ok_or(Error::InvalidPath)?;
    for path in glob::glob(pattern)? {
        let path = path?;
        info!("loading template {:?}", path);
        let template = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<TemplateOptions>()?;
        templates.push(template);
    }
    Ok(templates)
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, record: &Value) -> Result<(), Error> {
    let mut line = serde_json::to_vec(record)
        .map_err(|source| Error::Template(eventnative_core::Error::SerdeJson { source }))?;
    line.push(b'\n');
    output
        .write_all(&line)
        .await
        .map_err(|source| Error::IO { source })
}
