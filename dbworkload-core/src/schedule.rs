use crate::ConfigError;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::str::FromStr;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// One stretch of a run: ramp to `concurrency` over `ramp`, then hold until `duration` has
/// elapsed (counted from the start of the phase, ramp included).
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub concurrency: usize,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub ramp: Duration,
    /// `None` runs until every worker finishes or the run is interrupted.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub duration: Option<Duration>,
}

impl Phase {
    /// A ramp longer than the phase itself is clamped to the phase duration.
    pub fn new(concurrency: usize, ramp: Duration, duration: Option<Duration>) -> Self {
        let ramp = match duration {
            Some(duration) if ramp > duration => {
                warn!(
                    "Ramp of {}s exceeds phase duration of {}s, clamping",
                    ramp.as_secs_f64(),
                    duration.as_secs_f64()
                );
                duration
            }
            _ => ramp,
        };

        Self {
            concurrency,
            ramp,
            duration,
        }
    }

    pub fn from_minutes(concurrency: usize, ramp_min: f64, duration_min: Option<f64>) -> Self {
        Self::new(
            concurrency,
            minutes(ramp_min),
            duration_min.map(minutes),
        )
    }
}

fn minutes(m: f64) -> Duration {
    Duration::try_from_secs_f64(m * 60.).unwrap_or(Duration::ZERO)
}

/// Parses `<concurrency>:<ramp_minutes>:<duration_minutes>`. Ramp and duration may be left empty;
/// an empty duration makes the phase open-ended.
impl FromStr for Phase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPhase(s.to_string());
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }

        let concurrency = parts[0].parse::<usize>().map_err(|_| invalid())?;
        let parse_minutes = |idx: usize| -> Result<Option<f64>, ConfigError> {
            match parts.get(idx) {
                None | Some(&"") => Ok(None),
                Some(v) => match v.parse::<f64>() {
                    Ok(m) if m.is_finite() && m >= 0. => Ok(Some(m)),
                    _ => Err(invalid()),
                },
            }
        };
        let ramp = parse_minutes(1)?.unwrap_or(0.);
        let duration = parse_minutes(2)?;

        Ok(Phase::from_minutes(concurrency, ramp, duration))
    }
}

/// Ordered, non-empty list of phases. Only the last phase may be open-ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Phase>", into = "Vec<Phase>")]
pub struct Schedule {
    phases: Vec<Phase>,
}

impl Schedule {
    /// Ramps longer than their phase are clamped, however the phases were built.
    pub fn new(phases: Vec<Phase>) -> Result<Self, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }

        let last = phases.len() - 1;
        if let Some(index) = phases[..last].iter().position(|p| p.duration.is_none()) {
            return Err(ConfigError::UnboundedPhase { index });
        }

        let phases = phases
            .into_iter()
            .map(|p| Phase::new(p.concurrency, p.ramp, p.duration))
            .collect();
        Ok(Self { phases })
    }

    pub fn single(concurrency: usize, ramp: Duration, duration: Option<Duration>) -> Self {
        Self {
            phases: vec![Phase::new(concurrency, ramp, duration)],
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn iter(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Highest concurrency any phase asks for.
    pub fn peak_concurrency(&self) -> usize {
        self.phases.iter().map(|p| p.concurrency).max().unwrap_or(0)
    }
}

impl TryFrom<Vec<Phase>> for Schedule {
    type Error = ConfigError;

    fn try_from(phases: Vec<Phase>) -> Result<Self, Self::Error> {
        Schedule::new(phases)
    }
}

impl From<Schedule> for Vec<Phase> {
    fn from(schedule: Schedule) -> Self {
        schedule.phases
    }
}
