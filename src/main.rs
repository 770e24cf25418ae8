use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use secrecy::ExposeSecret;

use inbox_triage::classifier::Classifier;
use inbox_triage::config::{Config, PipelineConfig};
use inbox_triage::llm::create_provider;
use inbox_triage::mailbox::{MailStore, MailboxClient};
use inbox_triage::pipeline::Pipeline;
use inbox_triage::server::{self, AppState, CredentialSummary, DEFAULT_LOOKBACK_MINUTES};

const USAGE: &str = "usage: inbox-triage [serve | run [minutes]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_env().context("Invalid configuration")?;

    let llm = create_provider(&config.classifier)?;
    let classifier = Classifier::new(llm);
    let mailbox_config = config.mailbox.clone();
    let factory: server::PipelineFactory = Arc::new(move |pipeline_config: PipelineConfig| {
        let mailbox: Arc<dyn MailStore> = Arc::new(MailboxClient::new(mailbox_config.clone()));
        Pipeline::new(mailbox, classifier.clone(), pipeline_config)
    });

    match args.first().map(String::as_str) {
        None | Some("serve") => {
            let state = AppState {
                factory,
                pipeline_config: config.pipeline.clone(),
                cron_secret: config.server.cron_secret.clone(),
                credentials: CredentialSummary {
                    mailbox_user: config.mailbox.username.clone(),
                    has_app_password: !config.mailbox.password.expose_secret().is_empty(),
                    has_api_key: !config.classifier.api_key.expose_secret().is_empty(),
                },
            };
            eprintln!("📬 Inbox Triage v{}", env!("CARGO_PKG_VERSION"));
            eprintln!("   Mailbox: {}@{}", config.mailbox.username, config.mailbox.host);
            eprintln!("   Model: {}", config.classifier.model);
            eprintln!("   HTTP: http://0.0.0.0:{}/", config.server.port);
            server::serve(state, config.server.port)
                .await
                .context("HTTP server failed")?;
        }
        Some("run") => {
            let minutes = match args.get(1) {
                Some(raw) => raw
                    .parse::<u64>()
                    .with_context(|| format!("Invalid minutes value: {raw}"))?,
                None => DEFAULT_LOOKBACK_MINUTES,
            };
            let pipeline = factory(config.pipeline.clone());
            let report = pipeline
                .run(Duration::from_secs(minutes.saturating_mul(60)))
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.is_fatal() {
                bail!("Email processing failed: {}", report.errors.join("; "));
            }
        }
        Some(other) => bail!("Unknown command: {other}\n{USAGE}"),
    }

    Ok(())
}
