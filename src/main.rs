//! netcore CLI — runs a broker.
//!
//! The library is the product; this binary is the thin shell that stands a
//! tree up from the command line:
//!
//! ```sh
//! netcore tree --port 1305 --token T --group ops:secret --group lab:hunter2
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use netcore::Tree;

#[derive(Parser)]
#[command(name = "netcore", version, about = "Hub-and-spoke messaging and RPC fabric")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a broker (tree) until killed.
    Tree {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0")]
        ip: String,

        /// Port to listen on.
        #[arg(long, default_value_t = 1305)]
        port: u16,

        /// Admission token nodes must present. Omit to accept any token.
        #[arg(long)]
        token: Option<String>,

        /// Group and secret as NAME:SECRET. Repeatable.
        #[arg(long = "group", value_name = "NAME:SECRET")]
        groups: Vec<String>,

        /// Idle read window in seconds before a connection is dropped.
        #[arg(long, default_value_t = 300)]
        idle_timeout: u64,
    },
}

fn parse_group(spec: &str) -> Result<(String, String)> {
    match spec.split_once(':') {
        Some((name, secret)) if !name.is_empty() && !secret.is_empty() => {
            Ok((name.to_string(), secret.to_string()))
        }
        _ => bail!("group must be NAME:SECRET, got '{spec}'"),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Tree { ip, port, token, groups, idle_timeout } => {
            if groups.is_empty() {
                bail!("at least one --group NAME:SECRET is required");
            }
            let tree = Tree::new("netcore");
            if let Some(token) = token {
                tree.set_token(token);
            }
            for spec in &groups {
                let (name, secret) = parse_group(spec)?;
                tree.add_group(name, secret);
            }
            tree.set_idle_timeout(std::time::Duration::from_secs(idle_timeout));
            tree.run((ip.as_str(), port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_spec_parses() {
        assert_eq!(
            parse_group("ops:secret").unwrap(),
            ("ops".to_string(), "secret".to_string())
        );
        // Secrets may contain colons.
        assert_eq!(
            parse_group("ops:a:b").unwrap(),
            ("ops".to_string(), "a:b".to_string())
        );
        assert!(parse_group("no-colon").is_err());
        assert!(parse_group(":empty-name").is_err());
        assert!(parse_group("empty-secret:").is_err());
    }
}
