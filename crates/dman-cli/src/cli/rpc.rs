//! RPC mode: frames JSON envelopes over stdio and multiplexes many Downloads
//! in one process, for a host (e.g. a browser extension) that speaks this
//! protocol instead of invoking the CLI per file.

use anyhow::{Context, Result};
use dman_core::control::JobTable;
use dman_core::engine::{self, DownloadError, StatusSnapshot, Tunables};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    url: Option<String>,
    id: Option<i64>,
    filename: Option<String>,
    size: Option<u64>,
    conns: Option<usize>,
    stats: Option<Vec<StatusSnapshot>>,
    info: Option<bool>,
    error: Option<String>,
    dir: Option<String>,
}

fn read_message(stdin: &mut impl Read) -> io::Result<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = stdin.read_exact(&mut len_buf) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stdin.read_exact(&mut body)?;
    let envelope = serde_json::from_slice(&body)?;
    Ok(Some(envelope))
}

fn write_message(stdout: &mut impl Write, envelope: &Envelope) -> io::Result<()> {
    let body = serde_json::to_vec(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stdout.write_all(&(body.len() as u32).to_le_bytes())?;
    stdout.write_all(&body)?;
    stdout.flush()
}

fn job_id() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

struct Job {
    want_info: Arc<Mutex<bool>>,
}

/// Runs the RPC loop to completion (stdin EOF).
pub fn run(tunables: Tunables) -> Result<()> {
    let (out_tx, out_rx): (Sender<Envelope>, _) = channel();
    let writer = thread::spawn(move || {
        let mut stdout = io::stdout();
        while let Ok(envelope) = out_rx.recv() {
            let _ = write_message(&mut stdout, &envelope);
        }
    });

    let jobs: Arc<Mutex<HashMap<i64, Job>>> = Arc::new(Mutex::new(HashMap::new()));
    let control = Arc::new(JobTable::new());
    let mut stdin = io::stdin();

    loop {
        let envelope = match read_message(&mut stdin).context("reading RPC frame")? {
            Some(e) => e,
            None => break,
        };

        match envelope.kind.as_str() {
            "add" => handle_add(envelope, tunables, &jobs, &control, &out_tx),
            "pause" => {
                if let Some(id) = envelope.id {
                    control.request_stop(id);
                }
            }
            "pause-all" => control.request_stop_all(),
            "remove" => handle_remove(envelope, &out_tx),
            "info" => {
                if let (Some(id), Some(info)) = (envelope.id, envelope.info) {
                    if let Some(job) = jobs.lock().unwrap().get(&id) {
                        *job.want_info.lock().unwrap() = info;
                    }
                }
            }
            "open" => {
                let _ = out_tx.send(Envelope {
                    kind: "error".to_string(),
                    id: envelope.id,
                    error: Some("opening files via the platform file associator is not supported in this build".to_string()),
                    ..Default::default()
                });
            }
            other => {
                let _ = out_tx.send(Envelope {
                    kind: "error".to_string(),
                    error: Some(format!("unknown message kind: {other}")),
                    ..Default::default()
                });
            }
        }
    }

    drop(out_tx);
    let _ = writer.join();
    Ok(())
}

fn handle_add(
    envelope: Envelope,
    tunables: Tunables,
    jobs: &Arc<Mutex<HashMap<i64, Job>>>,
    control: &Arc<JobTable>,
    out_tx: &Sender<Envelope>,
) {
    let handle = match (&envelope.url, &envelope.filename) {
        (Some(url), _) => {
            let id = envelope.id.unwrap_or_else(job_id);
            let dir = envelope.dir.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            engine::start_new(id, url.clone(), dir, tunables)
        }
        (None, Some(filename)) => {
            let dir = envelope.dir.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            let descriptor_path = dir.join(".dman").join(format!("{filename}.{}.dman", envelope.id.unwrap_or(0)));
            match engine::resume(descriptor_path, None, tunables) {
                Ok(h) => h,
                Err(e) => {
                    let _ = out_tx.send(Envelope {
                        kind: "failed".to_string(),
                        id: envelope.id,
                        error: Some(e.to_string()),
                        ..Default::default()
                    });
                    return;
                }
            }
        }
        (None, None) => {
            let _ = out_tx.send(Envelope {
                kind: "error".to_string(),
                error: Some("add requires a url or a filename to resume".to_string()),
                ..Default::default()
            });
            return;
        }
    };

    let id = handle.id;
    let want_info = Arc::new(Mutex::new(false));
    control.register(id, handle.stop);
    jobs.lock().unwrap().insert(id, Job { want_info: Arc::clone(&want_info) });

    // The resolved filename/size arrive asynchronously (the first response's
    // headers, for a new download; immediately, on resume), so the "add"
    // reply is sent from its own thread rather than blocking the RPC loop.
    let discovered = handle.discovered;
    let add_out_tx = out_tx.clone();
    thread::spawn(move || {
        let (filename, size) = match discovered.recv() {
            Ok(d) => (Some(d.filename), d.content_length),
            Err(_) => (None, None),
        };
        let _ = add_out_tx.send(Envelope { kind: "add".to_string(), id: Some(id), filename, size, ..Default::default() });
    });

    let status_out_tx = out_tx.clone();
    let status_want_info = Arc::clone(&want_info);
    let status_rx = handle.status_rx;
    thread::spawn(move || {
        while let Ok(snap) = status_rx.recv() {
            if *status_want_info.lock().unwrap() {
                let _ = status_out_tx.send(Envelope {
                    kind: "info".to_string(),
                    id: Some(snap.id),
                    stats: Some(vec![snap]),
                    ..Default::default()
                });
            }
        }
    });

    let terminal_out_tx = out_tx.clone();
    let jobs_for_cleanup = Arc::clone(jobs);
    let control_for_cleanup = Arc::clone(control);
    thread::spawn(move || {
        let result = handle.join.join();
        jobs_for_cleanup.lock().unwrap().remove(&id);
        control_for_cleanup.unregister(id);
        let envelope = match result {
            Ok(Ok(path)) => Envelope {
                kind: "completed".to_string(),
                id: Some(id),
                filename: path.file_name().map(|n| n.to_string_lossy().into_owned()),
                ..Default::default()
            },
            Ok(Err(DownloadError::Paused)) => Envelope { kind: "pause".to_string(), id: Some(id), ..Default::default() },
            Ok(Err(e)) => Envelope { kind: "failed".to_string(), id: Some(id), error: Some(e.to_string()), ..Default::default() },
            Err(_) => Envelope {
                kind: "failed".to_string(),
                id: Some(id),
                error: Some("download thread panicked".to_string()),
                ..Default::default()
            },
        };
        let _ = terminal_out_tx.send(envelope);
    });
}

fn handle_remove(envelope: Envelope, out_tx: &Sender<Envelope>) {
    let (Some(filename), Some(id)) = (envelope.filename.clone(), envelope.id) else {
        let _ = out_tx.send(Envelope {
            kind: "error".to_string(),
            error: Some("remove requires filename and id".to_string()),
            ..Default::default()
        });
        return;
    };
    let dir = envelope.dir.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let part_dir = dir.join(".dman");
    let descriptor = part_dir.join(format!("{filename}.{id}.dman"));
    let _ = std::fs::remove_file(&descriptor);
    if let Ok(entries) = std::fs::read_dir(&part_dir) {
        let prefix = format!("{filename}.{id}.");
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(envelope: Envelope) -> Envelope {
        let mut buf = Vec::new();
        write_message(&mut buf, &envelope).unwrap();
        read_message(&mut Cursor::new(buf)).unwrap().unwrap()
    }

    #[test]
    fn add_message_roundtrips() {
        let e = Envelope { kind: "add".to_string(), url: Some("https://x/y.iso".to_string()), id: Some(7), ..Default::default() };
        let got = roundtrip(e);
        assert_eq!(got.kind, "add");
        assert_eq!(got.url.as_deref(), Some("https://x/y.iso"));
        assert_eq!(got.id, Some(7));
    }

    #[test]
    fn pause_and_pause_all_messages_roundtrip() {
        let got = roundtrip(Envelope { kind: "pause".to_string(), id: Some(3), ..Default::default() });
        assert_eq!(got.kind, "pause");
        assert_eq!(got.id, Some(3));

        let got = roundtrip(Envelope { kind: "pause-all".to_string(), ..Default::default() });
        assert_eq!(got.kind, "pause-all");
    }

    #[test]
    fn remove_message_roundtrips() {
        let e = Envelope {
            kind: "remove".to_string(),
            id: Some(1),
            filename: Some("file.iso".to_string()),
            dir: Some("/tmp/downloads".to_string()),
            ..Default::default()
        };
        let got = roundtrip(e);
        assert_eq!(got.kind, "remove");
        assert_eq!(got.filename.as_deref(), Some("file.iso"));
        assert_eq!(got.dir.as_deref(), Some("/tmp/downloads"));
    }

    #[test]
    fn info_message_roundtrips() {
        let got = roundtrip(Envelope { kind: "info".to_string(), id: Some(2), info: Some(true), ..Default::default() });
        assert_eq!(got.kind, "info");
        assert_eq!(got.info, Some(true));
    }

    #[test]
    fn open_message_roundtrips() {
        let got = roundtrip(Envelope { kind: "open".to_string(), id: Some(9), ..Default::default() });
        assert_eq!(got.kind, "open");
        assert_eq!(got.id, Some(9));
    }

    #[test]
    fn completed_failed_and_error_messages_roundtrip() {
        let got = roundtrip(Envelope { kind: "completed".to_string(), id: Some(1), filename: Some("a.iso".to_string()), ..Default::default() });
        assert_eq!(got.kind, "completed");
        assert_eq!(got.filename.as_deref(), Some("a.iso"));

        let got = roundtrip(Envelope { kind: "failed".to_string(), id: Some(1), error: Some("boom".to_string()), ..Default::default() });
        assert_eq!(got.kind, "failed");
        assert_eq!(got.error.as_deref(), Some("boom"));

        let got = roundtrip(Envelope { kind: "error".to_string(), error: Some("unknown message kind: bogus".to_string()), ..Default::default() });
        assert_eq!(got.kind, "error");
        assert_eq!(got.error.as_deref(), Some("unknown message kind: bogus"));
    }

    #[test]
    fn info_envelope_carries_a_status_snapshot() {
        let snap = StatusSnapshot {
            id: 5,
            rebuilding: false,
            speed: "1.00MB/s".to_string(),
            written: "10.00MB".to_string(),
            percent: 42.5,
            conns: 3,
            eta: "0:01:00".to_string(),
        };
        let got = roundtrip(Envelope { kind: "info".to_string(), id: Some(5), stats: Some(vec![snap]), ..Default::default() });
        let stats = got.stats.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].percent, 42.5);
        assert_eq!(stats[0].conns, 3);
    }

    #[test]
    fn read_message_returns_none_on_clean_eof() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(read_message(&mut empty).unwrap().is_none());
    }

    #[test]
    fn read_message_consecutive_frames_in_one_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Envelope { kind: "pause-all".to_string(), ..Default::default() }).unwrap();
        write_message(&mut buf, &Envelope { kind: "remove".to_string(), id: Some(1), ..Default::default() }).unwrap();
        let mut cursor = Cursor::new(buf);
        let first = read_message(&mut cursor).unwrap().unwrap();
        let second = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(first.kind, "pause-all");
        assert_eq!(second.kind, "remove");
        assert!(read_message(&mut cursor).unwrap().is_none());
    }
}
