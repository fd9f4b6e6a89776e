//! Splitting the `message.name` filter across requests.

use crate::error::{PollError, Result};

/// Default upper bound on the length of one request href.
pub const DEFAULT_MAX_URL_SIZE: usize = 8000;

/// Groups `names` into as few hrefs as possible, each at most `max_len`
/// bytes. `build` renders an href for a group of names.
///
/// Fails when a single name does not fit, naming the size that would.
pub fn batch_hrefs<F>(names: &[String], max_len: usize, build: F) -> Result<Vec<String>>
where
    F: Fn(&[String]) -> String,
{
    let mut hrefs = Vec::new();
    let mut start = 0;
    let mut end = 0;
    let mut last_fit: Option<String> = None;
    while end < names.len() {
        let href = build(&names[start..=end]);
        if href.len() <= max_len {
            last_fit = Some(href);
            end += 1;
            continue;
        }
        match last_fit.take() {
            Some(fit) => {
                hrefs.push(fit);
                start = end;
            }
            None => return Err(too_small(max_len, href.len())),
        }
    }
    hrefs.extend(last_fit);
    Ok(hrefs)
}

/// Checks that every name fits on its own.
pub fn check_fits<F>(names: &[String], max_len: usize, build: F) -> Result<()>
where
    F: Fn(&[String]) -> String,
{
    let longest = names
        .iter()
        .map(|n| build(std::slice::from_ref(n)).len())
        .max()
        .unwrap_or(0);
    if longest > max_len {
        return Err(too_small(max_len, longest));
    }
    Ok(())
}

fn too_small(max_len: usize, needed: usize) -> PollError {
    PollError::InvalidParam(format!(
        "max_url_size={max_len} is too small to form queries. Increase it to at least {needed}"
    ))
}
