//! Worker: one HTTP GET plus the copy loop that streams its body to a part file.
//!
//! Flow control is a permit channel, not a polled flag: the coordinator hands
//! the worker the size of the next buffer to copy (`min(LEN_CHECK,
//! length-received)`), replenished each time the worker reports a completed
//! copy via `CheckJob`. The worker's loop `recv`s a buffer size, copies
//! exactly that many bytes, reports it, and recvs again. Cancellation is the
//! same channel closing: the coordinator cancels a job by dropping its permit
//! sender, so the next `recv` fails and the copy loop aborts (a short write
//! forces libcurl to fail the request).

use crate::engine::coordinator::CoordinatorEvent;
use crate::engine::http::{self, GetOutcome};
use crate::engine::partfile;
use crate::engine::types::{DownloadError, SplitCandidate};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender};

/// Copies `data` to `file` in permit-sized pieces, reporting each piece to
/// the coordinator via `CheckJob` and blocking on `permit_rx` for the size of
/// the next piece before copying it. Returns `Paused` once the permit
/// channel closes (the coordinator cancelled this job).
fn write_chunk(
    file: &mut File,
    permit_rx: &Receiver<usize>,
    events: &Sender<CoordinatorEvent>,
    offset: u64,
    data: &[u8],
) -> Result<(), DownloadError> {
    let mut remaining = data;
    while !remaining.is_empty() {
        let permit = permit_rx.recv().map_err(|_| DownloadError::Paused)?;
        if permit == 0 {
            return Err(DownloadError::Paused);
        }
        let take = permit.min(remaining.len());
        let (piece, rest) = remaining.split_at(take);
        file.write_all(piece)?;
        let _ = events.send(CoordinatorEvent::CheckJob { offset, delta: piece.len() as u64 });
        remaining = rest;
    }
    Ok(())
}

/// Runs the very first connection of a brand new download: an unranged GET
/// at offset 0 that discovers the total length and filename from its own
/// response, then streams into the part file it creates on acceptance.
pub fn run_initial(
    id: i64,
    url: String,
    target_dir: PathBuf,
    events: Sender<CoordinatorEvent>,
    permit_rx: Receiver<usize>,
    len_check: usize,
) {
    let file_cell: Rc<RefCell<Option<File>>> = Rc::new(RefCell::new(None));
    let file_cell_chunks = Rc::clone(&file_cell);
    let events_headers = events.clone();
    let events_chunks = events.clone();

    let result = http::get(
        &url,
        &HashMap::new(),
        None,
        None,
        len_check,
        move |outcome: &GetOutcome| {
            let filename = crate::url_model::derive_filename(
                &outcome.final_url,
                outcome.content_disposition.as_deref(),
            );
            let path = partfile::part_file_path(&target_dir, &filename, id, 0);
            let file = partfile::create_part_file(&path)?;
            *file_cell.borrow_mut() = Some(file);
            let _ = events_headers.send(CoordinatorEvent::Discovered {
                content_length: outcome.content_length,
                filename,
            });
            Ok(())
        },
        move |data: &[u8]| {
            let mut file_ref = file_cell_chunks.borrow_mut();
            let file = file_ref.as_mut().expect("part file opened before body streamed");
            write_chunk(file, &permit_rx, &events_chunks, 0, data)
        },
    );

    let _ = events.send(CoordinatorEvent::JobDone { offset: 0, result: result.map(|_| ()) });
}

/// Runs a resumed job: the part file already exists with `received` bytes on
/// disk; the range request covers only the remaining bytes.
#[allow(clippy::too_many_arguments)]
pub fn run_resumed(
    offset: u64,
    length: u64,
    received: u64,
    url: String,
    part_path: PathBuf,
    events: Sender<CoordinatorEvent>,
    permit_rx: Receiver<usize>,
    len_check: usize,
) {
    let file = match partfile::open_part_file_for_resume(&part_path) {
        Ok((f, _)) => f,
        Err(e) => {
            let _ = events.send(CoordinatorEvent::JobDone { offset, result: Err(e.into()) });
            return;
        }
    };
    let file_cell = Rc::new(RefCell::new(file));
    let file_cell_chunks = Rc::clone(&file_cell);
    let events_chunks = events.clone();

    let range = (offset + received, offset + length - 1);
    let expected = length - received;

    let result = http::get(
        &url,
        &HashMap::new(),
        Some(range),
        Some(expected),
        len_check,
        |_outcome| Ok(()),
        move |data: &[u8]| {
            let mut file = file_cell_chunks.borrow_mut();
            write_chunk(&mut file, &permit_rx, &events_chunks, offset, data)
        },
    );

    // A content-length mismatch here means the descriptor's view of the
    // resource is stale, not generic bad data from the server.
    let result = result.map_err(|e| if matches!(e, DownloadError::BadData) { DownloadError::ServerChanged } else { e });

    let _ = events.send(CoordinatorEvent::JobDone { offset, result: result.map(|_| ()) });
}

/// Runs a splitter-spawned candidate job: validates the range response, then
/// asks the coordinator to accept it (via `InsertJob`) before opening its
/// part file and entering the normal copy loop. A rejection is reported as a
/// `JobDone` for an offset the coordinator never registered, which it
/// silently ignores.
#[allow(clippy::too_many_arguments)]
pub fn run_split(
    id: i64,
    candidate: SplitCandidate,
    url: String,
    target_dir: PathBuf,
    filename: String,
    events: Sender<CoordinatorEvent>,
    permit_tx: Sender<usize>,
    permit_rx: Receiver<usize>,
    len_check: usize,
) {
    let offset = candidate.new_offset;
    let length = candidate.new_length;
    let file_cell: Rc<RefCell<Option<File>>> = Rc::new(RefCell::new(None));
    let file_cell_chunks = Rc::clone(&file_cell);
    let events_headers = events.clone();
    let events_chunks = events.clone();
    let target_dir2 = target_dir.clone();
    let filename2 = filename.clone();

    let result = http::get(
        &url,
        &HashMap::new(),
        Some((offset, offset + length - 1)),
        Some(length),
        len_check,
        move |_outcome| {
            let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel::<bool>(1);
            let accepted = events_headers
                .send(CoordinatorEvent::InsertJob {
                    candidate,
                    permit_tx: permit_tx.clone(),
                    reply: reply_tx,
                })
                .is_ok()
                && matches!(reply_rx.recv(), Ok(true));
            if !accepted {
                return Err(DownloadError::Transport("split candidate no longer needed".to_string()));
            }
            let path = partfile::part_file_path(&target_dir2, &filename2, id, offset);
            let file = partfile::create_part_file(&path)?;
            *file_cell.borrow_mut() = Some(file);
            Ok(())
        },
        move |data: &[u8]| {
            let mut file_ref = file_cell_chunks.borrow_mut();
            let file = file_ref.as_mut().expect("part file opened on split acceptance");
            write_chunk(file, &permit_rx, &events_chunks, offset, data)
        },
    );

    let _ = events.send(CoordinatorEvent::JobDone { offset, result: result.map(|_| ()) });
}
