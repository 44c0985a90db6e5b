//! Optional interoperability tests against a real `svnserve` instance.
//!
//! These tests are opt-in: set `SVN_INTEROP=1` and ensure `svnadmin`, `svnserve`,
//! and `svn` are available on `PATH`.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use svn_core::auth::{AuthManager, CallbackProvider, Credential, CredentialRequest};
use svn_core::{ConnectionState, NodeKind, RaSvnClient, SvnError, SvnUrl};

fn run_async<T>(f: impl Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

fn interop_enabled() -> bool {
    matches!(
        std::env::var("SVN_INTEROP").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn command_exists(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn run_checked(program: &str, args: &[&str]) {
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    if !out.status.success() {
        panic!(
            "{program} {:?} failed: {}\nstderr:\n{}",
            args,
            out.status,
            String::from_utf8_lossy(&out.stderr)
        );
    }
}

fn file_url(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap();
    let s = canonical.to_string_lossy().replace('\\', "/");
    if s.starts_with('/') {
        format!("file://{s}")
    } else {
        format!("file:///{s}")
    }
}

/// Which `svnserve.conf` access rules the fixture runs with.
#[derive(Clone, Copy)]
enum Access {
    AnonymousRead,
    AuthenticatedOnly,
}

struct SvnserveFixture {
    _tmp: tempfile::TempDir,
    port: u16,
    svnserve: Child,
    stderr_log: std::path::PathBuf,
}

impl Drop for SvnserveFixture {
    fn drop(&mut self) {
        let _ = self.svnserve.kill();
        let _ = self.svnserve.wait();
    }
}

impl SvnserveFixture {
    fn url(&self) -> SvnUrl {
        SvnUrl::parse(&format!("svn://127.0.0.1:{}/repo", self.port)).unwrap()
    }

    async fn wait_ready(&mut self) {
        for _ in 0..200 {
            if let Ok(Some(status)) = self.svnserve.try_wait() {
                let stderr = std::fs::read_to_string(&self.stderr_log).unwrap_or_default();
                panic!("svnserve exited early: {status}\nstderr:\n{stderr}");
            }
            if tokio::net::TcpStream::connect(("127.0.0.1", self.port))
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("svnserve did not become ready on port {}", self.port);
    }
}

fn start_fixture(access: Access) -> SvnserveFixture {
    for bin in ["svnadmin", "svnserve", "svn"] {
        if !command_exists(bin) {
            panic!("{bin} is required for interop tests");
        }
    }

    let tmp = tempfile::TempDir::new().unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir_all(&root).unwrap();
    let repo = root.join("repo");
    run_checked("svnadmin", &["create", repo.to_str().unwrap()]);

    let conf = repo.join("conf");
    let mut svnserve_conf = std::fs::File::create(conf.join("svnserve.conf")).unwrap();
    writeln!(svnserve_conf, "[general]").unwrap();
    match access {
        Access::AnonymousRead => writeln!(svnserve_conf, "anon-access = read").unwrap(),
        Access::AuthenticatedOnly => writeln!(svnserve_conf, "anon-access = none").unwrap(),
    }
    writeln!(svnserve_conf, "auth-access = write").unwrap();
    writeln!(svnserve_conf, "password-db = passwd").unwrap();
    writeln!(svnserve_conf, "realm = svn-core-test").unwrap();

    let mut passwd = std::fs::File::create(conf.join("passwd")).unwrap();
    writeln!(passwd, "[users]").unwrap();
    writeln!(passwd, "alice = secret").unwrap();

    let import_dir = tmp.path().join("import");
    std::fs::create_dir_all(import_dir.join("trunk")).unwrap();
    std::fs::write(import_dir.join("trunk/hello.txt"), b"hello\n").unwrap();
    let repo_url = file_url(&repo);
    run_checked(
        "svn",
        &[
            "import",
            import_dir.to_str().unwrap(),
            repo_url.as_str(),
            "-m",
            "init",
            "--non-interactive",
        ],
    );

    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let stderr_log = tmp.path().join("svnserve.stderr.log");
    let log = std::fs::File::create(&stderr_log).unwrap();
    let log_err = log.try_clone().unwrap();
    let child = Command::new("svnserve")
        .arg("-d")
        .arg("--foreground")
        .arg("-r")
        .arg(&root)
        .arg("--listen-host")
        .arg("127.0.0.1")
        .arg("--listen-port")
        .arg(port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .unwrap();

    SvnserveFixture {
        _tmp: tmp,
        port,
        svnserve: child,
        stderr_log,
    }
}

#[test]
fn interop_svnserve_readonly_smoke() {
    if !interop_enabled() {
        return;
    }

    run_async(async {
        let mut fixture = start_fixture(Access::AnonymousRead);
        fixture.wait_ready().await;

        let mut session = RaSvnClient::new(fixture.url()).open_session().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(!session.repos_uuid().is_empty());

        let head = session.get_latest_rev().await.unwrap();
        assert!(head >= 1);
        assert_eq!(session.check_path("trunk", Some(head)).await.unwrap(), NodeKind::Dir);
        assert_eq!(
            session.check_path("trunk/missing.txt", None).await.unwrap(),
            NodeKind::None
        );

        let mut out = Vec::new();
        let result = session
            .get_file("trunk/hello.txt", Some(head), true, &mut out, 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(out, b"hello\n");
        assert_eq!(result.bytes_written, 6);

        let trunk = fixture.url().with_path("/repo/trunk");
        session.reparent(trunk).await.unwrap();
        assert_eq!(session.check_path("hello.txt", None).await.unwrap(), NodeKind::File);
    });
}

#[test]
fn interop_svnserve_cram_md5_with_retry() {
    if !interop_enabled() {
        return;
    }

    run_async(async {
        let mut fixture = start_fixture(Access::AuthenticatedOnly);
        fixture.wait_ready().await;

        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let auth = AuthManager::builder()
            .static_credentials("alice", "wrong")
            .interactive(CallbackProvider::new(move |req: &CredentialRequest<'_>| {
                seen.lock()
                    .unwrap()
                    .push(req.previous_error.map(str::to_string));
                Ok(Some(Credential::password("alice", "secret")))
            }))
            .build();

        let mut session = RaSvnClient::new(fixture.url())
            .with_auth_manager(auth)
            .open_session()
            .await
            .unwrap();
        assert_eq!(
            session.last_valid_credential().map(Credential::username),
            Some("alice")
        );
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].is_some());
        assert!(session.get_latest_rev().await.unwrap() >= 1);
    });
}

#[test]
fn interop_svnserve_rejects_bad_credentials() {
    if !interop_enabled() {
        return;
    }

    run_async(async {
        let mut fixture = start_fixture(Access::AuthenticatedOnly);
        fixture.wait_ready().await;

        let err = RaSvnClient::new(fixture.url())
            .with_auth_manager(AuthManager::with_credentials("alice", "wrong"))
            .open_session()
            .await
            .unwrap_err();
        assert!(matches!(err, SvnError::AuthFailed(_)), "{err}");
    });
}
