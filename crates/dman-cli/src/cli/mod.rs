//! Entry point dispatch: a single positional argument whose shape picks the
//! mode, per the ambient CLI surface around the download engine.

mod rpc;

use anyhow::{Context, Result};
use clap::Parser;
use dman_core::config;
use dman_core::engine::{self, DownloadError, StatusSnapshot, Tunables};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Parser)]
#[command(name = "dman")]
#[command(about = "dman: multi-connection HTTP(S) download manager", long_about = None)]
pub struct Cli {
    /// A direct http(s):// URL, a chrome-extension:// origin, or a progress-descriptor path.
    target: Option<String>,
    /// When `target` is a progress-descriptor path, overrides the URL recorded in it.
    url_override: Option<String>,
}

/// The mode `target`'s shape selects, independent of any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    NoInstaller,
    NewDownload(String),
    RpcAdapter,
    Resume(PathBuf),
}

fn classify(target: Option<&str>) -> Mode {
    match target {
        None => Mode::NoInstaller,
        Some(arg) if arg.starts_with("http://") || arg.starts_with("https://") => {
            Mode::NewDownload(arg.to_string())
        }
        Some(arg) if arg.starts_with("chrome-extension://") => Mode::RpcAdapter,
        Some(arg) => Mode::Resume(PathBuf::from(arg)),
    }
}

impl Cli {
    pub fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!(?cfg, "loaded config");
        let tunables = Tunables::from(&cfg);

        match classify(cli.target.as_deref()) {
            Mode::NoInstaller => {
                println!("dman: no installer registered for this build; nothing to do.");
                Ok(())
            }
            Mode::NewDownload(url) => run_new_download(url, tunables),
            Mode::RpcAdapter => rpc::run(tunables),
            Mode::Resume(path) => run_resume(path, cli.url_override, tunables),
        }
    }
}

fn job_id() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

fn print_status(snap: &StatusSnapshot) {
    if snap.rebuilding {
        eprintln!("rebuilding... {:.1}%", snap.percent);
    } else {
        eprintln!("{:>6.1}%  {}  {}  conns={}  eta={}", snap.percent, snap.written, snap.speed, snap.conns, snap.eta);
    }
}

fn drive_to_completion(handle: engine::DownloadHandle) -> Result<()> {
    let status_rx = handle.status_rx;
    let printer = std::thread::spawn(move || {
        while let Ok(snap) = status_rx.recv() {
            print_status(&snap);
        }
    });
    let result = handle.join.join().map_err(|_| anyhow::anyhow!("download thread panicked"))?;
    let _ = printer.join();
    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(())
        }
        Err(DownloadError::Paused) => {
            println!("paused");
            Ok(())
        }
        Err(e) => Err(e).context("download failed"),
    }
}

fn run_new_download(url: String, tunables: Tunables) -> Result<()> {
    let target_dir = std::env::current_dir().context("resolving current directory")?;
    let handle = engine::start_new(job_id(), url, target_dir, tunables);
    drive_to_completion(handle)
}

fn run_resume(progress_path: PathBuf, url_override: Option<String>, tunables: Tunables) -> Result<()> {
    let handle = engine::resume(progress_path, url_override, tunables).context("resuming download")?;
    drive_to_completion(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_argument_means_no_installer() {
        assert_eq!(classify(None), Mode::NoInstaller);
    }

    #[test]
    fn http_and_https_urls_start_a_new_download() {
        assert_eq!(
            classify(Some("http://example.com/f.iso")),
            Mode::NewDownload("http://example.com/f.iso".to_string())
        );
        assert_eq!(
            classify(Some("https://example.com/f.iso")),
            Mode::NewDownload("https://example.com/f.iso".to_string())
        );
    }

    #[test]
    fn chrome_extension_scheme_selects_the_rpc_adapter() {
        assert_eq!(classify(Some("chrome-extension://abcdefg/")), Mode::RpcAdapter);
    }

    #[test]
    fn anything_else_is_treated_as_a_progress_descriptor_path() {
        assert_eq!(
            classify(Some("/home/user/.dman/download.bin.3.dman")),
            Mode::Resume(PathBuf::from("/home/user/.dman/download.bin.3.dman"))
        );
        assert_eq!(classify(Some("relative/path.dman")), Mode::Resume(PathBuf::from("relative/path.dman")));
    }
}
