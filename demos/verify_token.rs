use nila_federation::prelude::*;
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;
use std::{env, fs};

#[derive(Debug, Deserialize)]
struct DemoConfig {
    audience: String,
    leeway_seconds: Option<u64>,
    #[serde(default)]
    allow_insecure_http: bool,
    providers: Vec<ProviderConfig>,
}

// Usage: cargo run --example verify_token -- [config.yaml] [token]
// The token is read from stdin when not given.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "demos/federation.yaml".to_string());

    // 1. Load the provider configuration.
    let config_str = fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read config file {}: {}", config_path, e))?;
    let demo_config: DemoConfig = serde_yaml::from_str(&config_str)?;

    let mut builder = VerifierConfigBuilder::new().default_audience(demo_config.audience);
    if let Some(leeway) = demo_config.leeway_seconds {
        builder = builder.leeway(Duration::from_secs(leeway));
    }
    if demo_config.allow_insecure_http {
        builder = builder.allow_insecure_http();
    }
    let verifier = FederatedVerifier::new(builder.build()?)?;

    // 2. Register every provider; discovery runs where no jwks_uri is given.
    for provider in demo_config.providers {
        let registered = verifier.register_provider(provider).await?;
        println!("Registered provider '{}' ({}), keys at {}", registered.id, registered.issuer, registered.jwks_uri);
    }

    // 3. Read the token.
    let token = match args.next() {
        Some(token) => token,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    // 4. Decide.
    match verifier.authenticate(token.trim()).await {
        VerificationResult::Authorized { robot_account } => {
            println!(
                "Authorized as robot account '{}' (provider '{}', rule '{}')",
                robot_account.name, robot_account.provider_id, robot_account.rule_id
            );
            for permission in &robot_account.permissions {
                println!("  {}: {:?}", permission.repository, permission.actions);
            }
        }
        VerificationResult::Rejected { reason } => {
            println!("Rejected [{}]: {}", reason.code(), reason);
            println!("Client would see: {}", reason.client_message());
        }
    }
    Ok(())
}
