//! The coordinator: the single state machine that owns one download's worker
//! set. All mutation of that state happens on this module's event loop,
//! which runs on its own thread; nothing outside it ever touches the jobs
//! map or the state variable directly.

use crate::engine::partfile;
use crate::engine::persistence::{self, ProgressDescriptor};
use crate::engine::rebuilder;
use crate::engine::splitter;
use crate::engine::status::{self, MovingAverage};
use crate::engine::tunables::{Tunables, LONG_TIME};
use crate::engine::types::{human_size, Discovered, DownloadError, JobRecord, SplitCandidate, StatusSnapshot};
use crate::engine::worker;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::thread;
use std::time::Instant;

/// Events consumed by the coordinator's single receive loop. Workers,
/// the splitter, the rebuilder, the stop-forwarder, and the tick timer all
/// hold a clone of the sender half and funnel into one `Receiver` here.
pub(crate) enum CoordinatorEvent {
    Discovered { content_length: Option<u64>, filename: String },
    CheckJob { offset: u64, delta: u64 },
    JobDone { offset: u64, result: Result<(), DownloadError> },
    InsertJob { candidate: SplitCandidate, permit_tx: Sender<usize>, reply: SyncSender<bool> },
    RebuildDone(Result<PathBuf, DownloadError>),
    Stop,
    Tick,
}

/// The buffer size to grant next: `min(len_check, remaining)`.
fn next_permit(len_check: usize, remaining: u64) -> usize {
    (len_check as u64).min(remaining) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Downloading,
    Stopping,
    Failing,
    Rebuilding,
}

struct ActiveJob {
    length: u64,
    received: u64,
    last_received: u64,
    eta: std::time::Duration,
    /// Grants the worker its next buffer size; dropping this closes the
    /// worker's permit channel and cancels it.
    permit_tx: Option<Sender<usize>>,
}

struct Coordinator {
    id: i64,
    url: String,
    target_dir: PathBuf,
    filename: Option<String>,
    /// -1 while unknown (only possible before the first job's response arrives).
    total_length: i64,
    tunables: Tunables,
    jobs: HashMap<u64, ActiveJob>,
    done: Vec<JobRecord>,
    state: State,
    main_error: Option<DownloadError>,
    split_in_flight: bool,
    moving_avg: MovingAverage,
    last_tick: Instant,
    status_tx: SyncSender<StatusSnapshot>,
    events_tx: Sender<CoordinatorEvent>,
    discovered_tx: SyncSender<Discovered>,
}

impl Coordinator {
    fn handle_discovered(&mut self, content_length: Option<u64>, filename: String) {
        self.filename = Some(filename.clone());
        self.total_length = content_length.map(|c| c as i64).unwrap_or(-1);
        if let Some(job) = self.jobs.get_mut(&0) {
            job.length = content_length.unwrap_or(u64::MAX);
        }
        let _ = self.discovered_tx.try_send(Discovered { filename, content_length });
    }

    fn handle_check_job(&mut self, offset: u64, delta: u64) {
        let len_check = self.tunables.len_check;
        if let Some(job) = self.jobs.get_mut(&offset) {
            job.received += delta;
            let remaining = job.length.saturating_sub(job.received);
            if remaining > 0 {
                if let Some(tx) = &job.permit_tx {
                    let _ = tx.send(next_permit(len_check, remaining));
                }
            }
        }
    }

    fn handle_job_done(
        &mut self,
        offset: u64,
        result: Result<(), DownloadError>,
    ) -> Option<Result<PathBuf, DownloadError>> {
        let job = self.jobs.remove(&offset)?;
        self.done.push(JobRecord { offset, length: job.length, received: job.received });

        match result {
            Ok(()) => match self.state {
                State::Downloading => {
                    if self.jobs.is_empty() {
                        if self.total_length < 0 {
                            if let Some(d) = self.done.iter().find(|d| d.offset == 0) {
                                self.total_length = d.received as i64;
                            }
                        }
                        self.state = State::Rebuilding;
                        self.spawn_rebuilder();
                    } else {
                        self.try_split();
                    }
                    None
                }
                State::Stopping => self.jobs.is_empty().then(|| self.finish_stopping()),
                State::Failing => self.jobs.is_empty().then(|| self.finish_failing()),
                State::Rebuilding => None,
            },
            Err(e) => match self.state {
                State::Downloading => {
                    self.main_error = Some(e);
                    self.state = State::Failing;
                    self.cancel_all();
                    self.jobs.is_empty().then(|| self.finish_failing())
                }
                State::Stopping => self.jobs.is_empty().then(|| self.finish_stopping()),
                State::Failing => self.jobs.is_empty().then(|| self.finish_failing()),
                State::Rebuilding => None,
            },
        }
    }

    fn handle_insert_job(&mut self, candidate: SplitCandidate, permit_tx: Sender<usize>, reply: SyncSender<bool>) {
        self.split_in_flight = false;
        let accept = self.state == State::Downloading
            && self.jobs.len() < self.tunables.max_workers
            && match self.jobs.get(&candidate.donor_offset) {
                Some(donor) => donor.received < donor.length.saturating_sub(candidate.new_length),
                None => false,
            };
        let _ = reply.send(accept);
        if !accept {
            return;
        }
        if let Some(donor) = self.jobs.get_mut(&candidate.donor_offset) {
            donor.length -= candidate.new_length;
        }
        self.jobs.insert(
            candidate.new_offset,
            ActiveJob {
                length: candidate.new_length,
                received: 0,
                last_received: 0,
                eta: LONG_TIME,
                permit_tx: Some(permit_tx),
            },
        );
        self.try_split();
    }

    fn handle_stop(&mut self) -> Option<Result<PathBuf, DownloadError>> {
        if self.state != State::Downloading {
            return None;
        }
        self.state = State::Stopping;
        self.cancel_all();
        self.jobs.is_empty().then(|| self.finish_stopping())
    }

    fn handle_tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick);
        self.last_tick = now;

        if self.state == State::Rebuilding {
            let first_offset = self.done.iter().map(|d| d.offset).min().unwrap_or(0);
            let filename = self.filename.as_deref().unwrap_or("");
            let path = partfile::part_file_path(&self.target_dir, filename, self.id, first_offset);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let percent = if self.total_length > 0 {
                (size as f64 / self.total_length as f64) * 100.0
            } else {
                0.0
            };
            let snap = StatusSnapshot {
                id: self.id,
                rebuilding: true,
                speed: "0.00B/s".to_string(),
                written: human_size(size as f64),
                percent,
                conns: 0,
                eta: "0:00:00".to_string(),
            };
            let _ = self.status_tx.try_send(snap);
            return;
        }

        let mut total_speed = 0.0;
        for job in self.jobs.values_mut() {
            let speed = status::job_speed(job.received, job.last_received, elapsed);
            job.eta = status::job_eta(job.length, job.received, speed);
            job.last_received = job.received;
            total_speed += speed;
        }
        self.moving_avg.push(total_speed);
        let avg_speed = self.moving_avg.average();

        let done_bytes: u64 = self.done.iter().map(|d| d.received).sum();
        let active_bytes: u64 = self.jobs.values().map(|j| j.received).sum();
        let written = done_bytes + active_bytes;
        let eta = if self.total_length > 0 {
            status::job_eta(self.total_length as u64, written, avg_speed)
        } else {
            LONG_TIME
        };
        let snap = status::build_snapshot(self.id, false, avg_speed, written, self.total_length, self.jobs.len(), eta);
        let _ = self.status_tx.try_send(snap);
    }

    fn try_split(&mut self) {
        if self.split_in_flight || self.total_length < 0 || self.jobs.len() >= self.tunables.max_workers {
            return;
        }
        let donor = splitter::pick_donor(self.jobs.iter().map(|(&off, j)| (off, j.length, j.received, j.eta)));
        let Some((off, len, received, eta)) = donor else { return };
        let Some(candidate) = splitter::make_candidate(off, len, received, eta, self.tunables.min_cut_eta) else {
            return;
        };

        self.split_in_flight = true;
        let len_check = self.tunables.len_check;
        let (permit_tx, permit_rx) = channel();
        let _ = permit_tx.send(next_permit(len_check, candidate.new_length));
        let events_tx = self.events_tx.clone();
        let url = self.url.clone();
        let target_dir = self.target_dir.clone();
        let filename = self.filename.clone().expect("filename known once total length is known");
        let id = self.id;
        thread::spawn(move || {
            worker::run_split(id, candidate, url, target_dir, filename, events_tx, permit_tx, permit_rx, len_check)
        });
    }

    fn cancel_all(&mut self) {
        for job in self.jobs.values_mut() {
            job.permit_tx = None;
        }
    }

    fn spawn_rebuilder(&self) {
        let parts: Vec<(u64, u64)> = self.done.iter().map(|d| (d.offset, d.length)).collect();
        let target_dir = self.target_dir.clone();
        let filename = self.filename.clone().expect("filename known before rebuilding");
        let id = self.id;
        let events_tx = self.events_tx.clone();
        thread::spawn(move || {
            let result = rebuilder::rebuild(&target_dir, &filename, id, parts);
            let _ = events_tx.send(CoordinatorEvent::RebuildDone(result));
        });
    }

    fn persist(&self) {
        if self.done.is_empty() {
            return;
        }
        let Some(filename) = self.filename.clone() else { return };
        let descriptor = ProgressDescriptor {
            id: self.id,
            url: self.url.clone(),
            filename,
            parts: self
                .done
                .iter()
                .map(|d| persistence::PartDescriptor { offset: d.offset, length: d.length, received: d.received })
                .collect(),
        };
        if let Err(e) = descriptor.save(&self.target_dir) {
            tracing::warn!(error = %e, "failed to persist progress descriptor");
        }
    }

    fn finish_stopping(&mut self) -> Result<PathBuf, DownloadError> {
        self.persist();
        Err(DownloadError::Paused)
    }

    fn finish_failing(&mut self) -> Result<PathBuf, DownloadError> {
        self.persist();
        Err(self.main_error.take().unwrap_or(DownloadError::Transport("unknown failure".to_string())))
    }

    fn run(mut self, events_rx: Receiver<CoordinatorEvent>) -> Result<PathBuf, DownloadError> {
        loop {
            let event = match events_rx.recv() {
                Ok(e) => e,
                Err(_) => return Err(DownloadError::Transport("event channel closed unexpectedly".to_string())),
            };
            let terminal = match event {
                CoordinatorEvent::Discovered { content_length, filename } => {
                    self.handle_discovered(content_length, filename);
                    None
                }
                CoordinatorEvent::CheckJob { offset, delta } => {
                    self.handle_check_job(offset, delta);
                    None
                }
                CoordinatorEvent::JobDone { offset, result } => self.handle_job_done(offset, result),
                CoordinatorEvent::InsertJob { candidate, permit_tx, reply } => {
                    self.handle_insert_job(candidate, permit_tx, reply);
                    None
                }
                CoordinatorEvent::Stop => self.handle_stop(),
                CoordinatorEvent::Tick => {
                    self.handle_tick();
                    None
                }
                CoordinatorEvent::RebuildDone(result) => Some(result),
            };
            if let Some(terminal) = terminal {
                return terminal;
            }
        }
    }
}

/// A running download: a stop sender, a lossy status receiver, a one-shot
/// receiver for the resolved filename/size, and a join handle yielding the
/// final file path or the terminating error.
pub struct DownloadHandle {
    pub id: i64,
    pub stop: Sender<()>,
    pub status_rx: Receiver<StatusSnapshot>,
    pub discovered: Receiver<Discovered>,
    pub join: thread::JoinHandle<Result<PathBuf, DownloadError>>,
}

fn spawn_support_threads(events_tx: Sender<CoordinatorEvent>, stat_interval: std::time::Duration) -> Sender<()> {
    let (stop_tx, stop_rx) = channel::<()>();
    let stop_events_tx = events_tx.clone();
    thread::spawn(move || {
        if stop_rx.recv().is_ok() {
            let _ = stop_events_tx.send(CoordinatorEvent::Stop);
        }
    });

    let tick_events_tx = events_tx;
    thread::spawn(move || loop {
        thread::sleep(stat_interval);
        if tick_events_tx.send(CoordinatorEvent::Tick).is_err() {
            break;
        }
    });

    stop_tx
}

/// Starts a brand new download of `url` into `target_dir`.
pub fn start_new(id: i64, url: String, target_dir: PathBuf, tunables: Tunables) -> DownloadHandle {
    let _ = partfile::ensure_part_dir(&target_dir);
    let (events_tx, events_rx) = channel::<CoordinatorEvent>();
    let (status_tx, status_rx) = sync_channel::<StatusSnapshot>(1);
    let (discovered_tx, discovered_rx) = sync_channel::<Discovered>(1);
    let stop_tx = spawn_support_threads(events_tx.clone(), tunables.stat_interval);

    let (permit_tx, permit_rx) = channel();
    let _ = permit_tx.send(tunables.len_check);
    let mut jobs = HashMap::new();
    jobs.insert(
        0,
        ActiveJob { length: u64::MAX, received: 0, last_received: 0, eta: LONG_TIME, permit_tx: Some(permit_tx) },
    );

    let coordinator = Coordinator {
        id,
        url: url.clone(),
        target_dir: target_dir.clone(),
        filename: None,
        total_length: -1,
        tunables,
        jobs,
        done: Vec::new(),
        state: State::Downloading,
        main_error: None,
        split_in_flight: false,
        moving_avg: MovingAverage::new(tunables.moving_avg_len),
        last_tick: Instant::now(),
        status_tx,
        events_tx: events_tx.clone(),
        discovered_tx,
    };

    let worker_events_tx = events_tx;
    let len_check = tunables.len_check;
    thread::spawn(move || worker::run_initial(id, url, target_dir, worker_events_tx, permit_rx, len_check));

    let join = thread::spawn(move || coordinator.run(events_rx));

    DownloadHandle { id, stop: stop_tx, status_rx, discovered: discovered_rx, join }
}

/// Resumes a download from an on-disk progress descriptor. `url_override`,
/// if given, replaces the URL recorded in the descriptor.
pub fn resume(
    progress_path: PathBuf,
    url_override: Option<String>,
    tunables: Tunables,
) -> Result<DownloadHandle, DownloadError> {
    let descriptor = ProgressDescriptor::load(&progress_path)?;
    let target_dir = ProgressDescriptor::infer_target_dir(&progress_path)
        .ok_or_else(|| DownloadError::LocalIo("cannot infer target directory from progress path".to_string()))?;
    let url = url_override.unwrap_or(descriptor.url.clone());
    let total_length: i64 = descriptor.parts.iter().map(|p| p.length).sum::<u64>() as i64;

    let (events_tx, events_rx) = channel::<CoordinatorEvent>();
    let (status_tx, status_rx) = sync_channel::<StatusSnapshot>(1);
    let (discovered_tx, discovered_rx) = sync_channel::<Discovered>(1);
    let _ = discovered_tx.try_send(Discovered {
        filename: descriptor.filename.clone(),
        content_length: (total_length >= 0).then_some(total_length as u64),
    });

    let mut jobs = HashMap::new();
    let mut done = Vec::new();
    for part in &descriptor.parts {
        let path = partfile::part_file_path(&target_dir, &descriptor.filename, descriptor.id, part.offset);
        let (_, on_disk_size) = partfile::open_part_file_for_resume(&path)?;
        let received = persistence::reconcile_received(on_disk_size).min(part.length);
        if received >= part.length {
            done.push(JobRecord { offset: part.offset, length: part.length, received });
            continue;
        }
        let (permit_tx, permit_rx) = channel();
        let _ = permit_tx.send(next_permit(tunables.len_check, part.length - received));
        jobs.insert(
            part.offset,
            ActiveJob { length: part.length, received, last_received: received, eta: LONG_TIME, permit_tx: Some(permit_tx) },
        );
        let events_tx2 = events_tx.clone();
        let url2 = url.clone();
        let part_path = path;
        let offset = part.offset;
        let length = part.length;
        let len_check = tunables.len_check;
        thread::spawn(move || worker::run_resumed(offset, length, received, url2, part_path, events_tx2, permit_rx, len_check));
    }

    let stop_tx = spawn_support_threads(events_tx.clone(), tunables.stat_interval);
    let _ = persistence::remove(&progress_path);

    let all_done_already = jobs.is_empty();
    let mut coordinator = Coordinator {
        id: descriptor.id,
        url,
        target_dir,
        filename: Some(descriptor.filename),
        total_length,
        tunables,
        jobs,
        done,
        state: State::Downloading,
        main_error: None,
        split_in_flight: false,
        moving_avg: MovingAverage::new(tunables.moving_avg_len),
        last_tick: Instant::now(),
        status_tx,
        events_tx,
        discovered_tx,
    };
    if all_done_already {
        coordinator.state = State::Rebuilding;
        coordinator.spawn_rebuilder();
    }

    let join = thread::spawn(move || coordinator.run(events_rx));

    Ok(DownloadHandle { id: descriptor.id, stop: stop_tx, status_rx, discovered: discovered_rx, join })
}
