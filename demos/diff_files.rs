//! Unified diff of two local files.
//!
//! Usage:
//! - `cargo run --example diff_files -- LEFT RIGHT`
//!
//! Optional:
//! - `DIFF_CONTEXT=3` (lines of context around each hunk)
//! - `DIFF_SEARCH_DEPTH=0.5` (anchor search exponent, `1.0` is unbounded)
//! - `RUST_LOG=svn_core=debug`

use std::path::PathBuf;

use svn_core::SvnError;
use svn_core::sequence::DiffOptions;
use svn_core::sequence::unified::{UnifiedDiff, WORKING_COPY_LABEL};
use tracing_subscriber::EnvFilter;

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, SvnError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|_| SvnError::InvalidPath(format!("invalid {name} '{raw}'")))?;
    Ok(Some(value))
}

fn main() -> svn_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    let [left, right] = args.as_slice() else {
        eprintln!("usage: diff_files LEFT RIGHT");
        return Ok(());
    };

    let mut options = DiffOptions::default();
    if let Some(exponent) = parse_env::<f64>("DIFF_SEARCH_DEPTH")? {
        options = options.with_search_depth(exponent);
    }
    let mut diff = UnifiedDiff::new(right.to_string_lossy())
        .with_labels(left.to_string_lossy(), WORKING_COPY_LABEL)
        .with_diff_options(options);
    if let Some(context) = parse_env::<usize>("DIFF_CONTEXT")? {
        diff = diff.with_context(context);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    diff.write(left.as_path(), right.as_path(), &mut out)?;
    Ok(())
}
