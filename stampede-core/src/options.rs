use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;

/// One segment of the piecewise-linear VU envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub target: u64,
}

/// The full knob-set for a run. Every field distinguishes "unset" from its
/// zero value so the layered resolver (defaults < file < script < env < CLI)
/// can tell which layer actually spoke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub vus: Option<u64>,
    pub vus_max: Option<u64>,
    #[serde(with = "opt_duration_millis")]
    pub duration: Option<Duration>,
    pub iterations: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    pub paused: Option<bool>,
    pub linger: Option<bool>,
    pub no_thresholds: Option<bool>,
    pub no_usage_report: Option<bool>,
    /// Collector descriptor, `type=arg`.
    pub out: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, Vec<String>>,

    // HTTP-level tuning, passed through to the VU-side client.
    pub max_redirects: Option<u32>,
    pub insecure_skip_tls_verify: Option<bool>,
    pub user_agent: Option<String>,
}

impl Options {
    /// Merges `other` on top of `self`: fields set in `other` win.
    #[must_use]
    pub fn apply(mut self, other: &Options) -> Options {
        self.vus = other.vus.or(self.vus);
        self.vus_max = other.vus_max.or(self.vus_max);
        self.duration = other.duration.or(self.duration);
        self.iterations = other.iterations.or(self.iterations);
        if !other.stages.is_empty() {
            self.stages = other.stages.clone();
        }
        self.paused = other.paused.or(self.paused);
        self.linger = other.linger.or(self.linger);
        self.no_thresholds = other.no_thresholds.or(self.no_thresholds);
        self.no_usage_report = other.no_usage_report.or(self.no_usage_report);
        self.out = other.out.clone().or(self.out);
        if !other.thresholds.is_empty() {
            self.thresholds = other.thresholds.clone();
        }
        self.max_redirects = other.max_redirects.or(self.max_redirects);
        self.insecure_skip_tls_verify = other
            .insecure_skip_tls_verify
            .or(self.insecure_skip_tls_verify);
        self.user_agent = other.user_agent.clone().or(self.user_agent);
        self
    }

    /// Applies the documented invariants once, after the final merge:
    ///
    /// - `duration == 0` means "unset" (run until externally stopped);
    /// - unset `vus-max` becomes `max(vus, highest stage target)`;
    /// - with no duration, iterations or stages, default to one iteration;
    /// - with stages but no duration, the run ends when the envelope does;
    /// - stage targets above `vus-max` are clamped.
    pub fn normalize(mut self) -> Result<Options, ConfigError> {
        if self.duration == Some(Duration::ZERO) {
            self.duration = None;
        }

        if self.iterations == Some(0) {
            return Err(ConfigError::InvalidIterations);
        }

        if !self.stages.is_empty() {
            let total: Duration = self
                .stages
                .iter()
                .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration));
            if total.is_zero() {
                return Err(ConfigError::InvalidStages);
            }
            if self.duration.is_none() {
                self.duration = Some(total);
            }
        }

        let vus = self.vus.unwrap_or(1);
        self.vus = Some(vus);

        if self.vus_max.is_none() {
            let max_stage = self.stages.iter().map(|s| s.target).max().unwrap_or(0);
            self.vus_max = Some(vus.max(max_stage));
        }
        let vus_max = self.vus_max.unwrap_or(vus);

        if vus > vus_max {
            return Err(ConfigError::VusExceedMax { vus, vus_max });
        }

        for stage in &mut self.stages {
            if stage.target > vus_max {
                tracing::warn!(
                    stage_target = stage.target,
                    vus_max,
                    "stage target exceeds vus-max, clamping"
                );
                stage.target = vus_max;
            }
        }

        if self.duration.is_none() && self.iterations.is_none() && self.stages.is_empty() {
            self.iterations = Some(1);
        }

        Ok(self)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
