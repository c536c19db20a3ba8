//! End-to-end scenarios for the download engine: start a local range-capable
//! server, drive a real `Download` against it, and check the files it leaves
//! behind.

mod common;

use dman_core::engine::{self, DownloadError, Tunables};
use std::time::Duration;
use tempfile::tempdir;

fn tunables_with_workers(max_workers: usize) -> Tunables {
    Tunables { max_workers, ..Tunables::default() }
}

fn recv_final(handle: engine::DownloadHandle) -> Result<std::path::PathBuf, DownloadError> {
    let status_rx = handle.status_rx;
    std::thread::spawn(move || while status_rx.recv().is_ok() {});
    handle.join.join().expect("coordinator thread panicked")
}

#[test]
fn small_file_single_worker_completes() {
    let body = b"abc".to_vec();
    let url = common::range_server::start(body.clone());
    let dir = tempdir().unwrap();

    let handle = engine::start_new(1, url, dir.path().to_path_buf(), tunables_with_workers(1));
    let final_path = recv_final(handle).expect("download should complete");

    assert_eq!(final_path, dir.path().join("download.bin"));
    assert_eq!(std::fs::read(&final_path).unwrap(), body);
    assert!(!dir.path().join(".dman").exists());
}

#[test]
fn larger_file_reassembles_correctly_with_multiple_workers() {
    let body: Vec<u8> = (0u8..251).cycle().take(1_048_576).collect();
    let url = common::range_server::start(body.clone());
    let dir = tempdir().unwrap();

    let handle = engine::start_new(2, url, dir.path().to_path_buf(), tunables_with_workers(4));
    let final_path = recv_final(handle).expect("download should complete");

    let content = std::fs::read(&final_path).unwrap();
    assert_eq!(content.len(), body.len());
    assert_eq!(content, body);
    assert!(!dir.path().join(".dman").exists());
}

#[test]
fn pause_leaves_descriptor_and_resume_completes() {
    let body: Vec<u8> = (0u8..200).cycle().take(4 * 1024 * 1024).collect();
    let url = start_throttled_range_server(body.clone());
    let dir = tempdir().unwrap();

    let handle = engine::start_new(3, url, dir.path().to_path_buf(), tunables_with_workers(4));
    let status_rx = handle.status_rx;
    // Wait for noticeable progress before pausing.
    loop {
        match status_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(snap) if snap.percent > 5.0 => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    handle.stop.send(()).unwrap();
    let result = handle.join.join().expect("coordinator thread panicked");
    assert!(matches!(result, Err(DownloadError::Paused)), "expected Paused, got {result:?}");

    let descriptor_path = dir.path().join(".dman").join("download.bin.3.dman");
    assert!(descriptor_path.exists(), "progress descriptor must survive a pause");

    let resumed = engine::resume(descriptor_path, None, tunables_with_workers(4)).expect("resume should start");
    let final_path = recv_final(resumed).expect("resumed download should complete");
    assert_eq!(std::fs::read(&final_path).unwrap(), body);
    assert!(!dir.path().join(".dman").exists());
}

#[test]
fn server_changed_on_resume_is_reported_and_descriptor_kept() {
    let body: Vec<u8> = (0u8..50).cycle().take(1000).collect();
    // Serves every range request with the full, unsliced body and its full
    // Content-Length, as if the resource had shrunk since the descriptor was
    // written: the response never matches what a resumed range request
    // expects.
    let url = start_server_ignoring_range(body);
    let dir = tempdir().unwrap();

    // Craft a descriptor claiming more remains than the server will actually
    // serve for that range, without ever having run a real download.
    let descriptor = dman_core::engine::ProgressDescriptor {
        id: 4,
        url,
        filename: "download.bin".to_string(),
        parts: vec![dman_core::engine::PartDescriptor { offset: 0, length: 1000, received: 400 }],
    };
    let part_dir = dir.path().join(".dman");
    std::fs::create_dir_all(&part_dir).unwrap();
    std::fs::write(part_dir.join("download.bin.4.0"), vec![0u8; 400]).unwrap();
    let descriptor_path = descriptor.save(dir.path()).unwrap();

    let resumed = engine::resume(descriptor_path.clone(), None, tunables_with_workers(4)).expect("resume should start");
    let result = recv_final(resumed);
    assert!(matches!(result, Err(DownloadError::ServerChanged)), "expected ServerChanged, got {result:?}");
    assert!(descriptor_path.exists(), "descriptor must remain after a failed resume");
}

/// A single-response server that answers every ranged GET with 206 but
/// reports the *original* unshrunk length in Content-Range/Content-Length
/// instead of the length the requested range implies, as if the resource had
/// grown or shrunk since the descriptor was written.
fn start_server_ignoring_range(body: Vec<u8>) -> String {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let mut stream = stream;
            let mut buf = [0u8; 8192];
            let _ = stream.read(&mut buf);
            // Always claims to be sending the whole body from byte 0, no
            // matter what range was actually requested.
            let response = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes 0-{}/{}\r\n\r\n",
                body.len(),
                body.len().saturating_sub(1),
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.write_all(&body);
        }
    });
    format!("http://127.0.0.1:{port}/")
}

#[test]
fn filename_is_derived_from_content_disposition_when_present() {
    let body = b"report contents".to_vec();
    let url = start_server_with_disposition(body.clone(), "attachment; filename=report.pdf");
    let dir = tempdir().unwrap();

    let handle = engine::start_new(5, url, dir.path().to_path_buf(), tunables_with_workers(1));
    let final_path = recv_final(handle).expect("download should complete");

    assert_eq!(final_path, dir.path().join("report.pdf"));
    assert_eq!(std::fs::read(&final_path).unwrap(), body);
}

/// A range-capable server like `common::range_server`, but one that writes
/// each response body in small, slightly delayed chunks so a test can
/// reliably observe a download mid-flight before it completes.
fn start_throttled_range_server(body: Vec<u8>) -> String {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            std::thread::spawn(move || {
                let mut stream = stream;
                let mut buf = [0u8; 8192];
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let request = std::str::from_utf8(&buf[..n]).unwrap_or("");
                let method = request.split_whitespace().next().unwrap_or("");
                let total = body.len() as u64;

                if method.eq_ignore_ascii_case("HEAD") {
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\n\r\n"
                    );
                    let _ = stream.write_all(response.as_bytes());
                    return;
                }

                let mut start = 0u64;
                let mut end_incl = total.saturating_sub(1);
                let mut has_range = false;
                for line in request.lines() {
                    if let Some((name, value)) = line.split_once(':') {
                        if name.trim().eq_ignore_ascii_case("range") {
                            has_range = true;
                            let value = value.trim();
                            if let Some(rest) = value.to_lowercase().strip_prefix("bytes=") {
                                if let Some((a, b)) = rest.split_once('-') {
                                    start = a.trim().parse().unwrap_or(0);
                                    if !b.trim().is_empty() {
                                        end_incl = b.trim().parse().unwrap_or(end_incl);
                                    }
                                }
                            }
                        }
                    }
                }
                let start = start.min(total) as usize;
                let end_excl = (end_incl + 1).min(total) as usize;
                let slice: &[u8] = if has_range {
                    body.get(start..end_excl).unwrap_or(&body[0..0])
                } else {
                    &body
                };
                let response = if has_range {
                    format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\n\r\n",
                        slice.len(), start, end_excl.saturating_sub(1), total
                    )
                } else {
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\n\r\n"
                    )
                };
                if stream.write_all(response.as_bytes()).is_err() {
                    return;
                }
                for chunk in slice.chunks(16 * 1024) {
                    if stream.write_all(chunk).is_err() {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            });
        }
    });
    format!("http://127.0.0.1:{port}/")
}

/// A single-response server that always answers 200 with the given
/// Content-Disposition header, regardless of the request it receives.
fn start_server_with_disposition(body: Vec<u8>, disposition: &'static str) -> String {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let mut stream = stream;
            let mut buf = [0u8; 8192];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Disposition: {}\r\n\r\n",
                body.len(),
                disposition
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.write_all(&body);
        }
    });
    format!("http://127.0.0.1:{port}/")
}
