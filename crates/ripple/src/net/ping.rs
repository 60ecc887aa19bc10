use std::time::Duration;

/// Factor applied to the standard deviation when reporting ping, so jittery
/// links report higher than their plain average.
const STDDEV_WEIGHT: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    pub ping_ms: u32,
    pub fails: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PingFailure {
    #[error("too many lost ping packets ({fails})")]
    LossTooHigh { fails: u32 },
}

/// Combines round trips into one ping value. `None` samples count as failures.
pub fn aggregate(
    samples: impl IntoIterator<Item = Option<Duration>>,
    allowed_fails: u32,
) -> Result<PingResult, PingFailure> {
    let mut fails = 0u32;
    let mut times = Vec::new();

    for sample in samples {
        match sample {
            Some(rtt) => times.push(rtt.as_secs_f64() * 1000.0),
            None => fails += 1,
        }
    }

    if fails > allowed_fails || times.is_empty() {
        return Err(PingFailure::LossTooHigh { fails });
    }

    let count = times.len() as f64;
    let average = times.iter().sum::<f64>() / count;
    let variance = times.iter().map(|t| (t - average).powi(2)).sum::<f64>() / count;
    let ping_ms = average + STDDEV_WEIGHT * variance.sqrt();

    Ok(PingResult {
        ping_ms: ping_ms.round() as u32,
        fails,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Option<Duration> {
        Some(Duration::from_millis(value))
    }

    #[test]
    fn test_constant_samples() {
        let result = aggregate([ms(20), ms(20), ms(20)], 0).unwrap();
        assert_eq!(result, PingResult { ping_ms: 20, fails: 0 });
    }

    #[test]
    fn test_stddev_weighting() {
        // average 20, population stddev 10
        let result = aggregate([ms(10), ms(30)], 0).unwrap();
        assert_eq!(result.ping_ms, 27);
    }

    #[test]
    fn test_failures_within_allowance() {
        let result = aggregate([ms(10), None, ms(10)], 1).unwrap();
        assert_eq!(result, PingResult { ping_ms: 10, fails: 1 });
    }

    #[test]
    fn test_too_many_failures() {
        assert_eq!(
            aggregate([ms(10), None, None], 1),
            Err(PingFailure::LossTooHigh { fails: 2 })
        );
    }

    #[test]
    fn test_all_failed_within_allowance() {
        assert_eq!(
            aggregate([None, None], 5),
            Err(PingFailure::LossTooHigh { fails: 2 })
        );
    }
}
