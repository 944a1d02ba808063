use rand::Rng;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep_until, Instant, Sleep};

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(timeout_ms)
}

/// A cancellable one-shot deadline.
///
/// Arming replaces any previous deadline, so the old timer can never fire
/// after the new one is set. An unarmed timer never fires.
#[derive(Debug, Default)]
pub struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self { sleep: None }
    }

    pub fn arm(&mut self, after: Duration) {
        let deadline = Instant::now() + after;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves when the armed deadline passes, disarming the timer
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_timeout_stays_in_range() {
        let min = Duration::from_millis(150);
        let max = Duration::from_millis(300);
        for _ in 0..200 {
            let t = random_election_timeout(min, max);
            assert!(t >= min && t <= max);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_fires_once() {
        let mut timer = Timer::new();
        timer.arm(Duration::from_millis(100));

        let start = Instant::now();
        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_pushes_deadline_back() {
        let mut timer = Timer::new();
        timer.arm(Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(40)).await;
        timer.arm(Duration::from_millis(100));

        let start = Instant::now();
        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut timer = Timer::new();
        timer.arm(Duration::from_millis(10));
        timer.cancel();

        let fired = tokio::time::timeout(Duration::from_secs(5), timer.fired()).await;
        assert!(fired.is_err());
    }
}
