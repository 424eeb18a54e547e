//! CLI for secrets and cluster operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use dpasswd::client::Client;

/// Read the envelope password from here before prompting
const PASSWORD_ENV: &str = "DPASSWD_PASSWORD";

#[derive(Parser)]
#[command(name = "dpasswd")]
#[command(about = "dpasswd replicated secret store CLI")]
#[command(version)]
struct Cli {
    /// Node HTTP address (any node serves reads; writes go to the leader)
    #[arg(long, default_value = "127.0.0.1:3100")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a secret and store it
    Add {
        /// Key
        key: String,

        /// Secret value (read from stdin if omitted)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Fetch and decrypt a secret
    Get {
        /// Key
        key: String,

        /// Print the stored value without decrypting it
        #[arg(long)]
        raw: bool,
    },

    /// Delete a key
    Delete {
        /// Key
        key: String,
    },

    /// Add a voter to the cluster (send to the leader)
    Join {
        /// Node ID of the new member
        node_id: String,

        /// Raft address of the new member
        raft_address: String,
    },

    /// Remove a member from the cluster (send to the leader)
    Remove {
        /// Node ID
        node_id: String,
    },

    /// Show raft status of the node
    Stats,
}

/// Read a line from the terminal without echoing it
fn prompt_hidden(prompt: &str) -> anyhow::Result<String> {
    rpassword::prompt_password(prompt).context("failed to read from the terminal")
}

/// The environment value when set, otherwise whatever `ask` reads.
fn password_from(
    env: Option<String>,
    ask: impl FnOnce() -> anyhow::Result<String>,
) -> anyhow::Result<String> {
    match env {
        Some(password) if !password.is_empty() => Ok(password),
        _ => ask(),
    }
}

fn password() -> anyhow::Result<String> {
    password_from(std::env::var(PASSWORD_ENV).ok(), || prompt_hidden("Password: "))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = Client::new(&cli.addr)?;

    match cli.command {
        Commands::Add { key, secret } => {
            let password = password()?;
            let secret = match secret {
                Some(secret) => secret,
                None => prompt_hidden("Secret: ")?,
            };
            client
                .add_secret(&key, secret.as_bytes(), password.as_bytes())
                .await?;
            println!("Stored {}", key);
        }

        Commands::Get { key, raw } => {
            if raw {
                let res = client.get(&key).await?;
                println!("{}", serde_json::to_string_pretty(&res.data)?);
            } else {
                let password = password()?;
                let secret = client.get_secret(&key, password.as_bytes()).await?;
                println!("{}", String::from_utf8_lossy(&secret));
            }
        }

        Commands::Delete { key } => {
            let res = client.delete(&key).await?;
            println!("{}", res.message);
        }

        Commands::Join {
            node_id,
            raft_address,
        } => {
            let res = client.join(&node_id, &raft_address).await?;
            println!("{}", res.message);
        }

        Commands::Remove { node_id } => {
            let res = client.remove(&node_id).await?;
            println!("{}", res.message);
        }

        Commands::Stats => {
            let res = client.stats().await?;
            println!("{}:", res.message);
            for (name, value) in &res.data {
                println!("  {}: {}", name, value);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_from_environment_skips_prompt() {
        let password = password_from(Some("hunter2".into()), || panic!("prompted")).unwrap();
        assert_eq!(password, "hunter2");
    }

    #[test]
    fn test_empty_or_missing_environment_prompts() {
        let asked = password_from(Some(String::new()), || Ok("typed".into())).unwrap();
        assert_eq!(asked, "typed");
        let asked = password_from(None, || Ok("typed".into())).unwrap();
        assert_eq!(asked, "typed");
    }
}
