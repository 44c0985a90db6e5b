//! Three-way merge of local files.
//!
//! Usage:
//! - `cargo run --example merge_files -- BASE MINE THEIRS`
//!
//! The merged text goes to stdout. The process exits with status 1 when the
//! result contains conflict markers.
//!
//! Optional:
//! - `MERGE_MINE_LABEL=.mine`
//! - `MERGE_THEIRS_LABEL=.r42`
//! - `RUST_LOG=svn_core=debug`

use std::io::Write;
use std::path::PathBuf;

use svn_core::merge::{MergeMarkers, MergeStatus, merge};
use tracing_subscriber::EnvFilter;

fn label(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn main() -> svn_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    let [base, mine, theirs] = args.as_slice() else {
        eprintln!("usage: merge_files BASE MINE THEIRS");
        return Ok(());
    };

    let markers = MergeMarkers::new(
        format!("<<<<<<< {}", label("MERGE_MINE_LABEL", ".mine")),
        "=======",
        format!(">>>>>>> {}", label("MERGE_THEIRS_LABEL", ".theirs")),
        "\n",
    );

    let mut out = Vec::new();
    let status = merge(base.as_path(), mine.as_path(), theirs.as_path(), &markers, &mut out)?;
    std::io::stdout().write_all(&out)?;

    match status {
        MergeStatus::Conflicted => {
            eprintln!("conflicts in {}", mine.display());
            std::process::exit(1);
        }
        MergeStatus::Merged => eprintln!("merged"),
        MergeStatus::Unchanged => eprintln!("unchanged"),
    }
    Ok(())
}
