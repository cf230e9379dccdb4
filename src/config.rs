//! Command-line and environment configuration.
//!
//! Every tunable has a default; most can also be set from the environment.
//! `Settings` is the validated form the rest of the program runs on.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use clap::Args;

use crate::aggregate::AggregatorConfig;
use crate::classify::ClassifierConfig;
use crate::models::{Channel, Location};
use crate::normalize::NormalizerConfig;
use crate::orchestrator::AlertSettings;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Args)]
pub struct RecognitionArgs {
    /// Landmarks reported below this visibility are ignored
    #[arg(long, env = "MIN_VISIBILITY", default_value_t = 0.5)]
    pub min_visibility: f32,
    /// Finger bend (degrees) above which a finger counts as folded
    #[arg(long, default_value_t = 60.0)]
    pub finger_curl_limit: f32,
    #[arg(long, default_value_t = 50.0)]
    pub thumb_curl_limit: f32,
    /// Thumb tip to knuckle distance, in palm lengths, below which the thumb is tucked
    #[arg(long, default_value_t = 0.7)]
    pub thumb_tuck_ratio: f32,
    #[arg(long, default_value_t = 55.0)]
    pub palm_tilt_limit: f32,
    #[arg(long, default_value_t = 4)]
    pub max_unknown_features: usize,
    #[arg(long, default_value_t = 0.8)]
    pub min_gesture_match: f32,

    /// Confidence a gesture needs to start being tracked
    #[arg(long, env = "ENTRY_THRESHOLD", default_value_t = 0.5)]
    pub entry_threshold: f32,
    /// Mean confidence a held gesture needs to be confirmed
    #[arg(long, env = "SUSTAIN_THRESHOLD", default_value_t = 0.6)]
    pub sustain_threshold: f32,
    #[arg(long, env = "WINDOW_MS", default_value_t = 1500)]
    pub window_ms: i64,
    /// How long a gesture must be held before it is confirmed
    #[arg(long, env = "MIN_SUSTAIN_MS", default_value_t = 1000)]
    pub min_sustain_ms: i64,
    #[arg(long, env = "AGREEMENT_RATIO", default_value_t = 0.7)]
    pub agreement_ratio: f32,
    #[arg(long, env = "MIN_SAMPLES", default_value_t = 5)]
    pub min_samples: usize,
}

#[derive(Debug, Clone, Args)]
pub struct AlertArgs {
    /// Who gets the alert
    #[arg(long, env = "RECIPIENT_PHONE_NUMBER", default_value = "")]
    pub recipient: String,
    /// Executable that delivers one message; without it alerts only ring locally
    #[arg(long, env = "ALERT_TRANSPORT_CMD")]
    pub transport_cmd: Option<PathBuf>,
    /// Extra leading argument for the transport command (repeatable)
    #[arg(long = "transport-arg")]
    pub transport_args: Vec<String>,
    #[arg(
        long,
        env = "ALERT_CHANNELS",
        value_enum,
        value_delimiter = ',',
        default_value = "sms,whatsapp"
    )]
    pub channels: Vec<Channel>,
    /// Seconds after an alert during which new confirmations are suppressed
    #[arg(long = "cooldown", env = "SMS_COOLDOWN", default_value_t = 30)]
    pub cooldown_secs: u64,
    #[arg(long, env = "RETRY_CAP", default_value_t = 3)]
    pub retry_cap: u32,
    #[arg(long, default_value_t = 500)]
    pub backoff_base_ms: u64,
    #[arg(long, default_value_t = 2.0)]
    pub backoff_multiplier: f64,
    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,
    #[arg(long = "attempt-timeout", default_value_t = 15)]
    pub attempt_timeout_secs: u64,
    #[arg(long = "evidence-timeout", default_value_t = 5)]
    pub evidence_timeout_secs: u64,
    /// How long in-flight deliveries get to finish on shutdown
    #[arg(long = "shutdown-grace", default_value_t = 20)]
    pub shutdown_grace_secs: u64,
    /// Where snapshots are written
    #[arg(long, env = "OUTPUT_DIR", default_value = "screenshots")]
    pub output_dir: PathBuf,
    #[arg(long, env = "ALERT_LATITUDE", requires = "longitude", allow_negative_numbers = true)]
    pub latitude: Option<f64>,
    #[arg(long, env = "ALERT_LONGITUDE", requires = "latitude", allow_negative_numbers = true)]
    pub longitude: Option<f64>,
    /// Human-readable name for the configured location
    #[arg(long, env = "ALERT_PLACE")]
    pub place: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Evidence log used when no database is configured
    #[arg(long, global = true, env = "LOG_FILE", default_value = "alert_log.jsonl")]
    pub log_file: PathBuf,
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub normalizer: NormalizerConfig,
    pub classifier: ClassifierConfig,
    pub aggregator: AggregatorConfig,
    pub alerts: AlertSettings,
    pub location: Option<Location>,
}

fn unit_interval(name: &str, value: f32) -> anyhow::Result<()> {
    ensure!(
        (0.0..=1.0).contains(&value),
        "{name} must be between 0 and 1, got {value}"
    );
    Ok(())
}

impl RecognitionArgs {
    fn configs(&self) -> (NormalizerConfig, ClassifierConfig, AggregatorConfig) {
        (
            NormalizerConfig {
                min_visibility: self.min_visibility,
                finger_curl_limit_deg: self.finger_curl_limit,
                thumb_curl_limit_deg: self.thumb_curl_limit,
            },
            ClassifierConfig {
                thumb_tuck_ratio: self.thumb_tuck_ratio,
                palm_tilt_limit_deg: self.palm_tilt_limit,
                max_unknown: self.max_unknown_features,
                min_match: self.min_gesture_match,
            },
            AggregatorConfig {
                entry_threshold: self.entry_threshold,
                sustain_threshold: self.sustain_threshold,
                window: chrono::Duration::milliseconds(self.window_ms),
                min_sustain: chrono::Duration::milliseconds(self.min_sustain_ms),
                agreement_ratio: self.agreement_ratio,
                min_samples: self.min_samples,
            },
        )
    }
}

impl Settings {
    /// Build and validate settings; recognition falls back to defaults when not given.
    pub fn from_args(
        recognition: Option<&RecognitionArgs>,
        alerts: &AlertArgs,
    ) -> anyhow::Result<Self> {
        let location = match (alerts.latitude, alerts.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
                place: alerts.place.clone(),
            }),
            (None, None) => None,
            _ => bail!("--latitude and --longitude must be given together"),
        };

        let mut channels = alerts.channels.clone();
        channels.sort();
        channels.dedup();

        let (normalizer, classifier, aggregator) = match recognition {
            Some(args) => args.configs(),
            None => Default::default(),
        };

        let settings = Self {
            normalizer,
            classifier,
            aggregator,
            alerts: AlertSettings {
                channels,
                recipient: alerts.recipient.clone(),
                retry: RetryPolicy {
                    max_attempts: alerts.retry_cap,
                    base_delay: Duration::from_millis(alerts.backoff_base_ms),
                    multiplier: alerts.backoff_multiplier,
                    max_delay: Duration::from_millis(alerts.backoff_max_ms),
                },
                cooldown: chrono::Duration::from_std(Duration::from_secs(alerts.cooldown_secs))
                    .context("cooldown out of range")?,
                attempt_timeout: Duration::from_secs(alerts.attempt_timeout_secs),
                evidence_timeout: Duration::from_secs(alerts.evidence_timeout_secs),
                shutdown_grace: Duration::from_secs(alerts.shutdown_grace_secs),
            },
            location,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        unit_interval("min-visibility", self.normalizer.min_visibility)?;
        unit_interval("min-gesture-match", self.classifier.min_match)?;
        ensure!(
            self.classifier.thumb_tuck_ratio > 0.0,
            "thumb-tuck-ratio must be positive"
        );
        ensure!(
            (0.0..=90.0).contains(&self.classifier.palm_tilt_limit_deg),
            "palm-tilt-limit must be between 0 and 90 degrees"
        );
        ensure!(
            self.normalizer.finger_curl_limit_deg > 0.0 && self.normalizer.thumb_curl_limit_deg > 0.0,
            "curl limits must be positive"
        );

        let agg = &self.aggregator;
        unit_interval("entry-threshold", agg.entry_threshold)?;
        unit_interval("sustain-threshold", agg.sustain_threshold)?;
        ensure!(
            agg.agreement_ratio > 0.5 && agg.agreement_ratio <= 1.0,
            "agreement-ratio must be above 0.5 and at most 1, got {}",
            agg.agreement_ratio
        );
        ensure!(agg.min_samples >= 2, "min-samples must be at least 2");
        ensure!(
            agg.min_sustain > chrono::Duration::zero(),
            "min-sustain-ms must be positive"
        );
        ensure!(
            agg.window >= agg.min_sustain,
            "window-ms ({}) must not be shorter than min-sustain-ms ({})",
            agg.window.num_milliseconds(),
            agg.min_sustain.num_milliseconds()
        );

        let alerts = &self.alerts;
        ensure!(!alerts.channels.is_empty(), "at least one channel is required");
        ensure!(alerts.retry.max_attempts >= 1, "retry-cap must be at least 1");
        ensure!(
            alerts.retry.multiplier >= 1.0,
            "backoff-multiplier must be at least 1"
        );
        ensure!(
            alerts.retry.max_delay >= alerts.retry.base_delay,
            "backoff-max-ms must not be below backoff-base-ms"
        );
        ensure!(
            !alerts.attempt_timeout.is_zero(),
            "attempt-timeout must be positive"
        );

        if let Some(location) = &self.location {
            ensure!(
                (-90.0..=90.0).contains(&location.latitude),
                "latitude {} out of range",
                location.latitude
            );
            ensure!(
                (-180.0..=180.0).contains(&location.longitude),
                "longitude {} out of range",
                location.longitude
            );
        }

        Ok(())
    }
}
