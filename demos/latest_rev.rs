//! Opens an `svn://` session, prints server info and the latest revision.
//!
//! Required:
//! - `SVN_URL=svn://host/repo`
//!
//! Optional:
//! - `SVN_USERNAME` / `SVN_PASSWORD`
//! - `SVN_AUTH_DIR=/path/to/auth` (remember accepted credentials on disk)
//! - `SVN_FILE=trunk/path/to/file` (stream the file to stdout)
//! - `SVN_MAX_BYTES=1048576`
//! - `RUST_LOG=svn_core=debug`

use std::time::Duration;

use svn_core::auth::AuthManager;
use svn_core::{Capability, RaSvnClient, SvnError, SvnUrl};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

fn main() -> svn_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run())
}

fn parse_u64_env(name: &str) -> Result<Option<u64>, SvnError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value = raw
        .parse::<u64>()
        .map_err(|_| SvnError::Protocol(format!("invalid {name} '{raw}'")))?;
    Ok(Some(value))
}

fn auth_manager() -> AuthManager {
    let mut builder = AuthManager::builder();
    if let (Ok(username), Ok(password)) = (
        std::env::var("SVN_USERNAME"),
        std::env::var("SVN_PASSWORD"),
    ) {
        builder = builder.static_credentials(username, password);
    }
    if let Ok(dir) = std::env::var("SVN_AUTH_DIR") {
        builder = builder.persistent_store(dir).store_auth(true);
    }
    builder.build()
}

async fn run() -> svn_core::Result<()> {
    let url = match std::env::var("SVN_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Set SVN_URL=svn://host/repo (optional SVN_USERNAME/SVN_PASSWORD).");
            return Ok(());
        }
    };

    let client = RaSvnClient::new(SvnUrl::parse(&url)?)
        .with_auth_manager(auth_manager())
        .with_connect_timeout(Duration::from_secs(10))
        .with_read_timeout(Duration::from_secs(60));

    let mut session = client.open_session().await?;
    println!("uuid: {}", session.repos_uuid());
    if let Some(root) = session.repos_root_url() {
        println!("root: {root}");
    }
    for cap in [
        Capability::EditPipeline,
        Capability::Depth,
        Capability::MergeInfo,
        Capability::LogRevProps,
    ] {
        println!("{}: {}", cap.as_wire_word(), session.has_capability(cap));
    }
    if let Some(cred) = session.last_valid_credential() {
        println!("authenticated as: {}", cred.username());
    }

    let latest = session.get_latest_rev().await?;
    println!("latest revision: r{latest}");

    if let Ok(file) = std::env::var("SVN_FILE") {
        let max_bytes = parse_u64_env("SVN_MAX_BYTES")?.unwrap_or(1_048_576);
        let mut stdout = tokio::io::stdout();
        let result = session
            .get_file(&file, Some(latest), false, &mut stdout, max_bytes)
            .await?;
        stdout.flush().await?;
        eprintln!("read {} bytes of {file}@{}", result.bytes_written, result.rev);
        if let Some(checksum) = result.checksum.as_deref() {
            eprintln!("checksum: {checksum}");
        }
    }

    session.close().await;
    Ok(())
}
