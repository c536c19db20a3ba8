//! HTTP GET with an optional `Range` header and streaming response handling.
//!
//! Built on `curl::easy`, following the same header/write-callback shape as
//! the rest of the crate's HTTP code: headers are collected line by line,
//! validated once the blank line terminating them arrives, and the body is
//! streamed to the caller chunk by chunk rather than buffered in memory.

use crate::engine::types::DownloadError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::str;
use std::time::Duration;

/// Parsed, validated response metadata for a completed header phase.
#[derive(Debug, Clone)]
pub struct GetOutcome {
    pub status: u32,
    pub content_length: Option<u64>,
    pub content_disposition: Option<String>,
    pub final_url: String,
}

fn parse_header_lines(lines: &[String]) -> (Option<u64>, Option<String>) {
    let mut content_length = None;
    let mut content_disposition = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<u64>().ok();
            }
            if name.eq_ignore_ascii_case("content-disposition") {
                content_disposition = Some(value.to_string());
            }
        }
    }
    (content_length, content_disposition)
}

fn parse_status_line(line: &str) -> Option<u32> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Performs one GET, optionally ranged, streaming the body to `on_chunk`.
///
/// `range` is an inclusive absolute byte range. `expected_content_length`,
/// when set, must equal the response's `Content-Length` or the request fails
/// with [`DownloadError::BadData`] (the "server sent bad data" case: the
/// server's view of the resource no longer matches what was requested).
/// `buffer_size` hints libcurl's maximum per-callback chunk size (the permit
/// unit `on_chunk` is expected to sub-divide further).
///
/// Returns the validated [`GetOutcome`] once headers have been checked; the
/// body has already been fully streamed to `on_chunk` by the time this
/// returns `Ok`.
pub fn get(
    url: &str,
    headers: &HashMap<String, String>,
    range: Option<(u64, u64)>,
    expected_content_length: Option<u64>,
    buffer_size: usize,
    mut on_headers: impl FnMut(&GetOutcome) -> Result<(), DownloadError>,
    mut on_chunk: impl FnMut(&[u8]) -> Result<(), DownloadError>,
) -> Result<GetOutcome, DownloadError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.connect_timeout(Duration::from_secs(30))?;
    easy.buffer_size(buffer_size)?;

    if let Some((start, end)) = range {
        easy.range(&format!("{}-{}", start, end))?;
    }

    let mut list = curl::easy::List::new();
    for (k, v) in headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    if !headers.is_empty() {
        easy.http_headers(list)?;
    }

    let status_line: Rc<RefCell<Option<u32>>> = Rc::new(RefCell::new(None));
    let header_lines: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let validated: Rc<RefCell<Option<Result<GetOutcome, DownloadError>>>> = Rc::new(RefCell::new(None));
    let chunk_error: Rc<RefCell<Option<DownloadError>>> = Rc::new(RefCell::new(None));

    let expect_status = if range.is_some() { 206 } else { 200 };
    let final_url = url.to_string();

    {
        let status_line_cb = Rc::clone(&status_line);
        let header_lines_cb = Rc::clone(&header_lines);
        let validated_cb = Rc::clone(&validated);

        let mut transfer = easy.transfer();
        transfer.header_function(move |data| {
            let Ok(s) = str::from_utf8(data) else {
                return true;
            };
            let line = s.trim_end();
            if line.starts_with("HTTP/") {
                header_lines_cb.borrow_mut().clear();
                *status_line_cb.borrow_mut() = parse_status_line(line);
            } else if !line.is_empty() {
                header_lines_cb.borrow_mut().push(line.to_string());
            } else {
                let status = status_line_cb.borrow().unwrap_or(0);
                let (content_length, content_disposition) =
                    parse_header_lines(&header_lines_cb.borrow());
                let mut outcome = validate(status, expect_status, content_length, expected_content_length)
                    .map(|()| GetOutcome {
                        status,
                        content_length,
                        content_disposition,
                        final_url: final_url.clone(),
                    });
                if let Ok(ref o) = outcome {
                    tracing::debug!(status = o.status, content_length = ?o.content_length, "response headers validated");
                    if let Err(e) = on_headers(o) {
                        outcome = Err(e);
                    }
                }
                *validated_cb.borrow_mut() = Some(outcome);
            }
            true
        })?;

        let validated_write = Rc::clone(&validated);
        let chunk_error_write = Rc::clone(&chunk_error);
        transfer.write_function(move |data| {
            if let Some(Err(_)) = validated_write.borrow().as_ref() {
                return Ok(0);
            }
            match on_chunk(data) {
                Ok(()) => Ok(data.len()),
                Err(e) => {
                    *chunk_error_write.borrow_mut() = Some(e);
                    Ok(0)
                }
            }
        })?;

        if let Err(e) = transfer.perform() {
            if let Some(err) = chunk_error.borrow_mut().take() {
                return Err(err);
            }
            if let Some(Err(err)) = validated.borrow_mut().take() {
                return Err(err);
            }
            return Err(DownloadError::from(e));
        }
    }

    let result = match validated.borrow_mut().take() {
        Some(outcome) => outcome,
        None => Err(DownloadError::BadResponse(0)),
    };
    result
}

fn validate(
    status: u32,
    expect_status: u32,
    content_length: Option<u64>,
    expected_content_length: Option<u64>,
) -> Result<(), DownloadError> {
    if status != expect_status {
        if expect_status == 206 && status == 200 {
            return Err(DownloadError::NotResumable);
        }
        return Err(DownloadError::BadResponse(status));
    }
    if let Some(expected) = expected_content_length {
        if content_length != Some(expected) {
            return Err(DownloadError::BadData);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ranged_accepts_206_matching_length() {
        assert!(validate(206, 206, Some(500), Some(500)).is_ok());
    }

    #[test]
    fn validate_ranged_rejects_200_as_not_resumable() {
        assert!(matches!(
            validate(200, 206, Some(500), Some(500)),
            Err(DownloadError::NotResumable)
        ));
    }

    #[test]
    fn validate_ranged_rejects_length_mismatch() {
        assert!(matches!(
            validate(206, 206, Some(499), Some(500)),
            Err(DownloadError::BadData)
        ));
    }

    #[test]
    fn validate_initial_accepts_200() {
        assert!(validate(200, 200, Some(500), None).is_ok());
    }

    #[test]
    fn parse_header_lines_extracts_length_and_disposition() {
        let lines = vec![
            "Content-Length: 42".to_string(),
            "Content-Disposition: attachment; filename=\"a.bin\"".to_string(),
        ];
        let (len, cd) = parse_header_lines(&lines);
        assert_eq!(len, Some(42));
        assert!(cd.unwrap().contains("a.bin"));
    }
}
