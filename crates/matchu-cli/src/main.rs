use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use matchu_core::{EngineManager, OnnxFactory, Verifier, probe_decoder};
use matchud::Config;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "matchu", about = "MatchU face verification and moderation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a selfie with a live capture using the local engine
    Verify {
        /// Reference selfie image
        selfie: PathBuf,
        /// Live capture image
        live: PathBuf,
        /// Override SIMILARITY_THRESHOLD (0.0 to 1.0)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Show engine health of a running matchud
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        url: String,
    },
    /// Classify a chat message with a running moderation service
    Moderate {
        text: String,
        #[arg(long, default_value = "http://127.0.0.1:8001")]
        url: String,
    },
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineHealth {
    status: String,
    engine_available: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    label: String,
    score: f32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify {
            selfie,
            live,
            threshold,
        } => verify(selfie, live, threshold).await,
        Commands::Status { url } => status(&url).await,
        Commands::Moderate { text, url } => moderate(&text, &url).await,
    }
}

async fn verify(selfie: PathBuf, live: PathBuf, threshold: Option<f32>) -> Result<()> {
    let config = Config::from_env()?;
    let threshold = resolve_threshold(threshold, config.similarity_threshold)?;
    tracing::debug!(threshold, model = %config.model_name, "verifying locally");
    let selfie = std::fs::read(&selfie).with_context(|| format!("reading {}", selfie.display()))?;
    let live = std::fs::read(&live).with_context(|| format!("reading {}", live.display()))?;

    let manager = EngineManager::new(OnnxFactory, config.engine_settings(), probe_decoder());
    let verifier = Verifier::new(Arc::new(manager));
    let decision = tokio::task::spawn_blocking(move || verifier.verify(&selfie, &live, threshold))
        .await??;

    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

/// Pick the flag over the configured threshold, bounded to [0, 1].
fn resolve_threshold(flag: Option<f32>, configured: f32) -> Result<f32> {
    match flag {
        Some(t) if !t.is_finite() => bail!("threshold must be a finite number, got {t}"),
        Some(t) => Ok(t.clamp(0.0, 1.0)),
        None => Ok(configured),
    }
}

/// Join a service base URL and a path.
fn endpoint(base: &str, path: &str) -> String {
    let url = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    tracing::debug!(url = %url, "calling service");
    url
}

fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?)
}

async fn status(url: &str) -> Result<()> {
    let health: EngineHealth = client()?
        .get(endpoint(url, "/health/engine"))
        .send()
        .await
        .with_context(|| format!("matchud not reachable at {url}"))?
        .error_for_status()?
        .json()
        .await?;

    println!("{}", serde_json::to_string_pretty(&health)?);
    if !health.engine_available {
        bail!(
            "engine degraded: {}",
            health.error.as_deref().unwrap_or("unknown_error")
        );
    }
    Ok(())
}

async fn moderate(text: &str, url: &str) -> Result<()> {
    let verdict: Verdict = client()?
        .post(endpoint(url, "/moderate"))
        .json(&serde_json::json!({ "text": text }))
        .send()
        .await
        .with_context(|| format!("moderation service not reachable at {url}"))?
        .error_for_status()?
        .json()
        .await?;

    println!("{} ({:.3})", verdict.label, verdict.score);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify_with_threshold() {
        let cli =
            Cli::try_parse_from(["matchu", "verify", "a.jpg", "b.jpg", "--threshold", "0.7"])
                .unwrap();
        match cli.command {
            Commands::Verify {
                selfie,
                live,
                threshold,
            } => {
                assert_eq!(selfie, PathBuf::from("a.jpg"));
                assert_eq!(live, PathBuf::from("b.jpg"));
                assert_eq!(threshold, Some(0.7));
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_status_default_url() {
        let cli = Cli::try_parse_from(["matchu", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { url } if url == "http://127.0.0.1:8000"));
    }

    #[test]
    fn test_threshold_rejects_non_finite() {
        assert!(resolve_threshold(Some(f32::NAN), 0.65).is_err());
        assert!(resolve_threshold(Some(f32::INFINITY), 0.65).is_err());

        let cli =
            Cli::try_parse_from(["matchu", "verify", "a", "b", "--threshold", "NaN"]).unwrap();
        let Commands::Verify { threshold, .. } = cli.command else {
            panic!("expected verify");
        };
        assert!(resolve_threshold(threshold, 0.65).is_err());
    }

    #[test]
    fn test_threshold_resolution() {
        assert_eq!(resolve_threshold(None, 0.65).unwrap(), 0.65);
        assert_eq!(resolve_threshold(Some(1.4), 0.65).unwrap(), 1.0);
        assert_eq!(resolve_threshold(Some(0.7), 0.65).unwrap(), 0.7);
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(
            endpoint("http://127.0.0.1:8000/", "/health/engine"),
            "http://127.0.0.1:8000/health/engine"
        );
        assert_eq!(endpoint("http://svc", "moderate"), "http://svc/moderate");
    }

    #[test]
    fn test_engine_health_payload() {
        let health: EngineHealth = serde_json::from_str(
            r#"{"status":"degraded","engineAvailable":false,"error":"dependency_missing: x"}"#,
        )
        .unwrap();
        assert!(!health.engine_available);
        assert_eq!(health.error.as_deref(), Some("dependency_missing: x"));
    }
}
