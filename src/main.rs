use std::sync::Arc;

use leadpilot::config::EngineConfig;
use leadpilot::dispatch::{Deliverer, DispatchScheduler, InProcessScheduler, SmtpMailer};
use leadpilot::inbound::{FsRawMail, InboundRecord};
use leadpilot::llm::HttpLlmClient;
use leadpilot::pipeline::EmailProcessor;
use leadpilot::ratelimit::RateLimiter;
use leadpilot::store::LibSqlStore;
use tokio::io::AsyncBufReadExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export LEADPILOT_LLM_API_KEY=...");
        std::process::exit(1);
    });

    let db_path =
        std::env::var("LEADPILOT_DB_PATH").unwrap_or_else(|_| "./data/leadpilot.db".to_string());
    let store = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );

    let smtp_host = std::env::var("LEADPILOT_SMTP_HOST").unwrap_or_else(|_| {
        eprintln!("Error: LEADPILOT_SMTP_HOST not set");
        std::process::exit(1);
    });
    let smtp_port: u16 = std::env::var("LEADPILOT_SMTP_PORT")
        .unwrap_or_else(|_| "587".to_string())
        .parse()
        .unwrap_or(587);
    let smtp_user = std::env::var("LEADPILOT_SMTP_USER").unwrap_or_default();
    let smtp_pass = std::env::var("LEADPILOT_SMTP_PASS").unwrap_or_default();

    let mail_dir =
        std::env::var("LEADPILOT_MAIL_DIR").unwrap_or_else(|_| "./data/mail".to_string());

    eprintln!("📬 Leadpilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {db_path}");
    eprintln!("   Mail dir: {mail_dir}");
    eprintln!("   SMTP: {smtp_host}:{smtp_port}");
    eprintln!("   Reading inbound envelopes from stdin, one JSON object per line.\n");

    let llm = Arc::new(HttpLlmClient::new(
        &config.llm_api_url,
        config.llm_api_key.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(store.clone(), &config));

    let mailer = Arc::new(SmtpMailer::new(smtp_host, smtp_port, smtp_user, smtp_pass));
    let deliverer = Arc::new(Deliverer::new(store.clone(), mailer));
    let schedule_client = Arc::new(InProcessScheduler::new(deliverer));
    let scheduler = DispatchScheduler::new(store.clone(), schedule_client, &config);

    let raw_mail = Arc::new(FsRawMail::new(mail_dir));
    let processor = EmailProcessor::new(store, raw_mail, llm, limiter, scheduler, &config);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match InboundRecord::from_json(&line) {
            Ok(record) => processor.process_batch(&[record]).await,
            Err(e) => tracing::error!(error = %e, "skipping malformed envelope"),
        }
    }

    Ok(())
}
