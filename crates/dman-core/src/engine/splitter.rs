//! Splitting policy: choose the slowest remaining job and halve it.

use crate::engine::types::SplitCandidate;
use std::time::Duration;

/// Picks the offset of the job with the greatest remaining bytes among
/// `jobs` (offset, length, received, eta). Ties broken by lowest offset.
pub fn pick_donor(jobs: impl Iterator<Item = (u64, u64, u64, Duration)>) -> Option<(u64, u64, u64, Duration)> {
    jobs.max_by_key(|&(offset, length, received, _)| (length.saturating_sub(received), std::cmp::Reverse(offset)))
}

/// Builds a split candidate from the chosen donor, or `None` if the donor
/// has no free bytes left or hasn't got enough remaining time to be worth
/// splitting (`min_cut_eta`).
pub fn make_candidate(
    donor_offset: u64,
    donor_length: u64,
    donor_received: u64,
    donor_eta: Duration,
    min_cut_eta: Duration,
) -> Option<SplitCandidate> {
    let free = donor_length.saturating_sub(donor_received);
    if free == 0 || donor_eta < min_cut_eta {
        return None;
    }
    let new_length = free / 2;
    if new_length == 0 {
        return None;
    }
    let new_offset = donor_offset + donor_length - new_length;
    Some(SplitCandidate { donor_offset, new_offset, new_length })
}
