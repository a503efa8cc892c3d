//! Provision a user and print a bearer token for it.
//!
//! Usage:
//!   MARKETWIRE_TOKEN_SECRET=... \
//!     cargo run --bin marketwire-token -- --db chat.db --user alice --role client
//!
//! The user row is created or updated (role, display name) so the server
//! resolves the token to the intended role.

use anyhow::{Context, Result};
use clap::Parser;

use marketwire_server::db::Db;
use marketwire_server::identity::{Role, TokenResolver};

#[derive(Parser)]
#[command(name = "marketwire-token", about = "Provision a user and mint a bearer token")]
struct Args {
    /// SQLite database shared with the server.
    #[arg(long, env = "MARKETWIRE_DB")]
    db: String,

    /// Token secret; must match the server's.
    #[arg(long, env = "MARKETWIRE_TOKEN_SECRET", hide_env_values = true)]
    secret: String,

    /// User id to provision.
    #[arg(long)]
    user: String,

    /// admin, client or talent.
    #[arg(long, default_value = "client")]
    role: Role,

    #[arg(long)]
    display_name: Option<String>,

    /// Token lifetime.
    #[arg(long, default_value_t = 720)]
    ttl_hours: i64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let db = Db::open(&args.db).with_context(|| format!("Failed to open database {}", args.db))?;
    db.upsert_user(&args.user, args.role, args.display_name.as_deref())
        .with_context(|| format!("Failed to provision user {}", args.user))?;

    let tokens = TokenResolver::new(&args.secret);
    let token = tokens.issue(&args.user, chrono::Duration::hours(args.ttl_hours));
    eprintln!("Provisioned {} as {}", args.user, args.role.as_str());
    println!("{token}");
    Ok(())
}
