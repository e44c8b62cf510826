use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mpf_db::Store;
use mpf_mastodon::RestClient;
use mpf_server::AppState;
use tracing::info;

const ENV_PORT: &str = "MASTOPOOF_PORT";
const DEFAULT_PORT: u16 = 8079;

#[derive(Parser)]
#[command(name = "mastopoof")]
#[command(about = "Mastodon stream aggregator", long_about = None)]
struct Cli {
    /// Database file path. Falls back to MASTOPOOF_DB.
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server.
    Serve {
        /// Listening port. Falls back to MASTOPOOF_PORT, then 8079.
        #[arg(long)]
        port: Option<u16>,

        /// Require this invite code on signup.
        #[arg(long)]
        invite_code: Option<String>,

        /// Default Mastodon server suggested by the frontend.
        #[arg(long)]
        default_server: Option<String>,
    },

    /// List users.
    Users,

    /// Show one user's summary.
    User {
        #[arg(long)]
        uid: i64,
    },

    /// Check a stream's counters against its content; repair with --fix.
    CheckStream {
        #[arg(long)]
        stid: i64,

        /// Apply repairs instead of only reporting.
        #[arg(long)]
        fix: bool,
    },

    /// Run the server against an embedded fake Mastodon (development).
    Testserve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Serve {
            port,
            invite_code,
            default_server,
        } => {
            let store = open_store(cli.db.as_deref()).await?;
            let state = Arc::new(AppState::new(
                Arc::clone(&store),
                Arc::new(RestClient::new()),
                invite_code,
                default_server,
            ));
            mpf_db::spawn_optimize(Arc::clone(&store));
            mpf_server::serve(state, bind_addr(port)).await?;
        }

        Commands::Users => {
            let store = open_store(cli.db.as_deref()).await?;
            let mut conn = store.read().await?;
            for user in mpf_db::list_users(conn.as_mut()).await? {
                println!("uid={} default_stid={}", user.uid, user.default_stid);
            }
        }

        Commands::User { uid } => {
            let store = open_store(cli.db.as_deref()).await?;
            let mut conn = store.read().await?;
            let user = mpf_db::user_state(conn.as_mut(), uid).await?;
            println!("uid={}", user.uid);
            println!("default_stid={}", user.default_stid);
            println!("list_count={}", user.settings.list_count());
            for account in mpf_db::accounts_for_user(conn.as_mut(), uid).await? {
                println!(
                    "account asid={} server={} username={} last_home_status_id={}",
                    account.asid,
                    account.server_addr,
                    account.username,
                    account.last_home_status_id.as_deref().unwrap_or("-"),
                );
            }
            let stream = mpf_db::stream_state(conn.as_mut(), user.default_stid).await?;
            println!(
                "stream stid={} first={} last={} last_read={} remaining={}",
                stream.stid,
                stream.first_position,
                stream.last_position,
                stream.last_read,
                stream.remaining,
            );
        }

        Commands::CheckStream { stid, fix } => {
            let store = open_store(cli.db.as_deref()).await?;
            check_stream(&store, stid, fix).await?;
        }

        Commands::Testserve { port } => {
            let store = Arc::new(Store::open_in_memory().await?);
            mpf_db::migrate(&store).await?;

            let fake = Arc::new(mpf_testkit::FakeMastodon::new());
            for i in 0..12 {
                fake.post_status(&format!("test status number {i} #demo"), &["demo"]);
            }

            let state = Arc::new(AppState::new(
                store,
                fake,
                None,
                Some(mpf_testkit::FAKE_SERVER.to_string()),
            ));
            info!("testserve: fake upstream at {}", mpf_testkit::FAKE_SERVER);
            mpf_server::serve(state, bind_addr(port)).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn open_store(db_flag: Option<&str>) -> Result<Arc<Store>> {
    let path = match db_flag {
        Some(p) => p.to_string(),
        None => std::env::var(mpf_db::ENV_DB)
            .with_context(|| format!("missing --db flag and {} env var", mpf_db::ENV_DB))?,
    };
    let store = Store::open(&path).await?;
    mpf_db::migrate(&store).await?;
    Ok(Arc::new(store))
}

fn bind_addr(port_flag: Option<u16>) -> SocketAddr {
    let port = port_flag
        .or_else(|| std::env::var(ENV_PORT).ok().and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_PORT);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Compare stored stream counters with what the content table implies;
/// optionally repair.
async fn check_stream(store: &Store, stid: i64, fix: bool) -> Result<()> {
    let mut txn = store.begin().await?;
    let stored = mpf_db::stream_state(txn.conn(), stid).await?;

    if fix {
        let dup = mpf_stream::fix_duplicate_statuses(txn.conn(), stid).await?;
        let cross = mpf_stream::fix_cross_statuses(txn.conn(), stid).await?;
        println!("deleted_duplicate_rows={dup}");
        println!("deleted_cross_rows={cross}");
    }

    let derived = mpf_stream::recompute_stream_state(txn.conn(), stid).await?;
    let clean = stored.first_position == derived.first_position
        && stored.last_position == derived.last_position
        && stored.last_read == derived.last_read
        && stored.remaining == derived.remaining;

    println!(
        "stored first={} last={} last_read={} remaining={}",
        stored.first_position, stored.last_position, stored.last_read, stored.remaining
    );
    println!(
        "derived first={} last={} last_read={} remaining={}",
        derived.first_position, derived.last_position, derived.last_read, derived.remaining
    );

    if fix {
        mpf_db::set_stream_state(txn.conn(), &derived).await?;
        txn.commit().await?;
        println!("state=fixed");
    } else {
        txn.rollback().await?;
        if clean {
            println!("state=clean");
        } else {
            bail!("stream {stid} counters diverge from content (re-run with --fix)");
        }
    }
    Ok(())
}
