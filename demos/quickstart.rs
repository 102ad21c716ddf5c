use anyhow::Result;
use self_operate::computer::{ActionExecutor, ScreenCapture};
use self_operate::{
    BrowserConfig, ChromiumDesktop, ModelClient, NoopDesktop, OllamaClient, OperateConfig,
    Operator, OperatorEvent, SessionManager,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = Arc::new(OperateConfig::from_env());
    let objective = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "open a text editor and type hello".to_string());

    // OPERATE_DRY_RUN=1 skips Chromium entirely.
    let dry_run = std::env::var("OPERATE_DRY_RUN").map(|v| v == "1").unwrap_or(false);
    let (screen, executor): (Arc<dyn ScreenCapture>, Arc<dyn ActionExecutor>) = if dry_run {
        (Arc::new(NoopDesktop), Arc::new(NoopDesktop))
    } else {
        let desktop = match std::env::var("CHROME_WS_URL") {
            Ok(ws) if !ws.trim().is_empty() => ChromiumDesktop::connect(&ws, (1280, 800)).await?,
            _ => ChromiumDesktop::launch(BrowserConfig { headless: false, ..Default::default() }).await?,
        };
        let desktop = Arc::new(desktop);
        (desktop.clone(), desktop)
    };

    let client = ModelClient::new(Arc::new(OllamaClient::new(&cfg)?), screen, cfg.clone());
    let operator = Arc::new(Operator::new(client, executor, cfg.clone()));
    let manager = SessionManager::new(operator);

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                OperatorEvent::Log { entry, .. } => {
                    println!("[{}] {} {}", entry.timestamp.format("%H:%M:%S"), entry.kind, entry.details)
                }
                OperatorEvent::Error { message, remediation, .. } => {
                    eprintln!("error: {message}");
                    if let Some(hint) = remediation {
                        eprintln!("hint: {hint}");
                    }
                }
                other => println!("{}", serde_json::to_string(other).unwrap_or_default()),
            }
        }
    });

    let session_id = manager.start(&objective, None).await?;
    let outcome = manager.wait(&session_id).await?;
    let logs = manager.logs(&session_id)?;
    println!("{}", serde_json::to_string_pretty(&logs.summary)?);
    std::process::exit(outcome.exit_code());
}
