use std::io::{self, Write};

use anyhow::Result;

use crate::config::SharedConfig;

/// Interactive first-time setup.
///
/// Prompts on the controlling terminal for the values a pairing peer can
/// also deliver later over the credentials characteristic. Defaults come
/// from the current config, so rerunning with `--reset` only changes what
/// the operator actually types. Always clears `provisioned`; this is the
/// one path that does.
pub async fn run(config: &SharedConfig) -> Result<()> {
    let current = config.snapshot().await;

    println!();
    println!("Gateway setup");
    println!("-------------");

    let device_name = prompt("Device name", &current.device_name)?;
    let api_endpoint = prompt("API base URL", &current.api_endpoint.to_string())?;
    let invite_code = prompt("Invite code", &current.invite_code)?;

    config
        .update(|config| {
            config.device_name = device_name;
            match api_endpoint.parse() {
                Ok(endpoint) => config.api_endpoint = endpoint,
                Err(err) => eprintln!("ignoring invalid API base URL: {err}"),
            }
            config.invite_code = invite_code;
            config.provisioned = false;
        })
        .await?;

    println!();
    println!("Configuration saved.");
    println!();

    Ok(())
}

fn prompt(label: &str, default: &str) -> io::Result<String> {
    if default.is_empty() {
        print!("{label}: ");
    } else {
        print!("{label} [{default}]: ");
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;

    let line = line.trim();
    Ok(if line.is_empty() {
        default.to_owned()
    } else {
        line.to_owned()
    })
}
