//! Bounded polling

use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

/// Poll `check` every `interval` until it returns `Ok(true)` or `timeout`
/// elapses. Errors from `check` abort the wait. Returns the time waited.
pub fn wait_for<F>(
    description: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<Duration>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if check()? {
            let elapsed = start.elapsed();
            debug!("{description}: done after {attempt} attempt(s), {elapsed:?}");
            return Ok(elapsed);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(eyre!(
                "Timed out after {}s waiting for {description}",
                timeout.as_secs_f64()
            ));
        }
        std::thread::sleep(interval.min(timeout - elapsed));
    }
}
