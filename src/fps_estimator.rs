use log::debug;
use std::time::{Duration, Instant};

// Paces the driver loop at a target rate and tracks the rate actually achieved.
#[derive(Debug)]
pub struct FpsEstimator {
    iteration_start: Instant,
    pub iteration_duration: Duration,
    smoothed_dt: Option<f64>,
}

// std::thread::sleep overshoots by up to this much, spin for the remainder.
static NATIVE_SLEEP_ACCURACY: Duration = Duration::from_micros(500);

const SMOOTHING: f64 = 0.1;

impl FpsEstimator {
    pub fn new(fps: f64) -> FpsEstimator {
        FpsEstimator {
            iteration_start: Instant::now(),
            iteration_duration: Duration::from_secs_f64(1.0 / fps.max(1e-3)),
            smoothed_dt: None,
        }
    }

    fn high_resolution_sleep_until(done: &Instant) {
        let now = Instant::now();
        let system_sleep_until = done.checked_sub(NATIVE_SLEEP_ACCURACY).unwrap_or(now);
        if now < system_sleep_until {
            std::thread::sleep(system_sleep_until.duration_since(now));
        }
        while Instant::now() < *done {
            std::hint::spin_loop();
        }
    }

    /// Waits out the rest of the frame budget and returns the time since the
    /// previous tick.
    pub fn tick(&mut self) -> Duration {
        let sleep_until = self.iteration_start + self.iteration_duration;
        let now = Instant::now();
        if now > sleep_until {
            debug!("Over time budget by: {:?}", now - sleep_until);
        } else {
            FpsEstimator::high_resolution_sleep_until(&sleep_until);
        }
        let delta_t = self.iteration_start.elapsed();
        self.iteration_start = Instant::now();
        self.record(delta_t);
        delta_t
    }

    fn record(&mut self, delta_t: Duration) {
        let dt = delta_t.as_secs_f64();
        self.smoothed_dt = Some(match self.smoothed_dt {
            Some(smoothed) => smoothed + (dt - smoothed) * SMOOTHING,
            None => dt,
        });
    }

    /// Smoothed frames per second, zero before the first tick.
    pub fn fps(&self) -> f64 {
        match self.smoothed_dt {
            Some(dt) if dt > 0.0 => 1.0 / dt,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_waits_for_budget() {
        let mut fps = FpsEstimator::new(200.0);
        assert_eq!(fps.fps(), 0.0);
        let dt = fps.tick();
        assert!(dt >= Duration::from_millis(5));
        assert!(fps.fps() > 0.0 && fps.fps() <= 200.0);
    }

    #[test]
    fn smoothing_converges() {
        let mut fps = FpsEstimator::new(60.0);
        for _ in 0..200 {
            fps.record(Duration::from_millis(20));
        }
        assert!((fps.fps() - 50.0).abs() < 1e-6);
    }

    // Get some stats about std::thread::sleep
    #[test]
    #[ignore] // Takes a few seconds, run on demand.
    fn sleep_test() {
        let target: f64 = 1.0 / 60.0;
        let mut max_err: f64 = 0.0;
        for _ in 0..1000 {
            let now = Instant::now();
            std::thread::sleep(Duration::from_secs_f64(target));
            let err = now.elapsed().as_secs_f64() - target;
            max_err = max_err.max(err);
        }
        println!("Max: {}", max_err);
    }
}
