//! Fetches a path over HTTP/WebDAV and prints the body.
//!
//! Required:
//! - `SVN_URL=http://host/svn/repo/trunk/file.txt`
//!
//! Optional:
//! - `SVN_USERNAME` / `SVN_PASSWORD` (answers Basic or Digest challenges)
//! - `SVN_METHOD=PROPFIND` (sent with `Depth: 0`)
//! - `RUST_LOG=svn_core=debug`

use std::io::Write;

use svn_core::auth::AuthManager;
use svn_core::http::{Depth, HttpConnection, HttpRequest, RequestBody, error_message};
use svn_core::transport::TcpConnector;
use svn_core::{SvnError, SvnUrl};
use tracing_subscriber::EnvFilter;

const PROPFIND_BODY: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
<propfind xmlns=\"DAV:\"><allprop/></propfind>";

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

async fn run() -> svn_core::Result<()> {
    let url = match std::env::var("SVN_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Set SVN_URL=http://host/svn/repo/path (optional SVN_USERNAME/SVN_PASSWORD).");
            return Ok(());
        }
    };
    let url = SvnUrl::parse(&url)?;
    let path = url.path.clone();

    let mut conn = HttpConnection::new(url, TcpConnector::new()).with_user_agent(concat!(
        "svn-core-dav-get/",
        env!("CARGO_PKG_VERSION")
    ));
    if let (Ok(username), Ok(password)) = (
        std::env::var("SVN_USERNAME"),
        std::env::var("SVN_PASSWORD"),
    ) {
        conn = conn.with_auth_manager(AuthManager::with_credentials(username, password));
    }

    let method = std::env::var("SVN_METHOD").unwrap_or_else(|_| "GET".to_string());
    let mut request = HttpRequest::new(method.as_str(), path);
    if method.eq_ignore_ascii_case("PROPFIND") {
        request = request
            .depth(Depth::Zero)
            .header("Content-Type", "text/xml")
            .body(RequestBody::Bytes(PROPFIND_BODY.as_bytes().to_vec()))
            .ok_codes(&[207]);
    }

    let (status, body) = match conn.request_bytes(request).await {
        Ok(response) => response,
        Err(SvnError::RequestFailed { status, message }) => {
            eprintln!("{status}: {message}");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    eprintln!("{} {}", status.code, status.reason);
    if !status.is_success() {
        eprintln!("{}", error_message(&String::from_utf8_lossy(&body)));
    }
    std::io::stdout().write_all(&body)?;
    conn.close().await;
    Ok(())
}
