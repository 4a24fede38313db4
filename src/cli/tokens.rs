//! `token rotate|revoke|mint|list`

use super::output::{emit, print_table_header, print_table_row, OutputFormat};
use crate::domain::{TokenId, TokenKind, TokenStatus, TokenSummary};
use crate::startup::App;
use anyhow::Result;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Replace a token with a fresh one and revoke the old value
    Rotate {
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,

        /// root or service
        #[arg(short, long, default_value = "root")]
        kind: TokenKind,
    },

    /// Revoke a managed service token
    Revoke {
        #[arg(long, value_name = "TOKEN_ID")]
        id: TokenId,
    },

    /// Create a service token under the active root
    Mint {
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,

        /// Policy to attach; repeat for several
        #[arg(short, long = "policy", value_name = "POLICY", required = true)]
        policies: Vec<String>,

        /// Token TTL, e.g. 768h
        #[arg(long)]
        ttl: Option<String>,
    },

    /// List managed tokens (metadata only)
    List {
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,
    },
}

pub async fn handle_token_command(app: &App, command: TokenCommands, format: OutputFormat) -> Result<()> {
    let summaries = match command {
        TokenCommands::Rotate { environment, kind } => {
            let environment = app.environment_name(environment)?;
            vec![app.tokens.rotate(kind, &environment).await?.summary()]
        }
        TokenCommands::Revoke { id } => vec![app.tokens.revoke(&id).await?.summary()],
        TokenCommands::Mint { environment, policies, ttl } => {
            let environment = app.environment_name(environment)?;
            vec![app.tokens.mint_service_token(&environment, &policies, ttl.as_deref()).await?.summary()]
        }
        TokenCommands::List { environment } => {
            let environment = app.environment_name(environment)?;
            app.tokens.list(&environment).await?
        }
    };
    emit(&summaries, format, |tokens| print_tokens(tokens))
}

fn print_tokens(tokens: &[TokenSummary]) {
    if tokens.is_empty() {
        println!("No managed tokens");
        return;
    }
    let columns = [("ID", 38), ("Kind", 12), ("Status", 9), ("Policies", 30), ("Created", 20)];
    print_table_header(&columns);
    for token in tokens {
        print_table_row(
            &columns,
            &[
                token.id.to_string(),
                token.kind.to_string(),
                token.status.as_str().to_string(),
                token.policies.join(","),
                token.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        );
    }
    let active = tokens.iter().filter(|t| t.status == TokenStatus::Active).count();
    println!("\n{active} active");
}
