//! `tether-server pair` — obtain a workstation credential via device-code
//! pairing. Prints the code, then polls until a viewer verifies it.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::Value;

use crate::paths;

const POLL_INTERVAL: Duration = Duration::from_secs(3);

pub async fn run(relay_url: &str) -> anyhow::Result<()> {
    let relay_url = relay_url.trim_end_matches('/');
    let http = reqwest::Client::new();

    let begin: Value = http
        .post(format!("{relay_url}/pair"))
        .send()
        .await
        .context("relay unreachable")?
        .json()
        .await
        .context("unexpected pairing response")?;

    let code = begin["code"]
        .as_str()
        .context("pairing response missing code")?
        .to_string();
    let verification_url = begin["verification_url"].as_str().unwrap_or(relay_url);
    let expires_in = begin["expires_in"].as_u64().unwrap_or(600);

    println!();
    println!("  Pairing code: {code}");
    println!("  Verify from a signed-in viewer: {verification_url}");
    println!("  Expires in {} minutes.", expires_in / 60);
    println!();

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let response = http
            .get(format!("{relay_url}/pair/{code}"))
            .send()
            .await
            .context("relay unreachable while polling")?;
        match response.status().as_u16() {
            200 => {
                let body: Value = response.json().await.context("malformed credential body")?;
                let token = body["token"]
                    .as_str()
                    .context("credential body missing token")?;
                let path = paths::credential_file_path();
                std::fs::write(&path, token)?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
                println!("  Paired. Credential saved to {}", path.display());
                println!("  Start the manager with: tether-server manager");
                println!();
                return Ok(());
            }
            202 => continue,
            410 => bail!("pairing code expired before verification"),
            other => bail!("unexpected pairing status {other}"),
        }
    }
}
