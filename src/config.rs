//! Controller configuration from `KUBE_READINESS_*` environment variables

use crate::controller::queue::Backoff;
use crate::model::condition::DEFAULT_READINESS_GATE;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Namespace to watch, all namespaces when unset
    pub namespace: Option<String>,
    /// Readiness gate condition type
    pub gate: String,
    pub aws_region: String,
    pub assume_role_arn: Option<String>,
    /// Cache load balancer and target health answers
    pub sdk_cache: bool,
    pub health_port: u16,
    pub leader_election: bool,
    /// Workers per queue
    pub workers: usize,
    /// Failed attempts per key before it is dropped
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Deadline for every Kubernetes and cloud call
    pub call_timeout: Duration,
    /// Re-check period of a resolved ingress
    pub ingress_recheck: Duration,
    /// Re-check period of every known ingress and pod
    pub resync: Duration,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: None,
            gate: DEFAULT_READINESS_GATE.to_string(),
            aws_region: "eu-west-1".to_string(),
            assume_role_arn: None,
            sdk_cache: false,
            health_port: 8080,
            leader_election: false,
            workers: 2,
            max_retries: 15,
            backoff: Backoff::default(),
            call_timeout: Duration::from_secs(10),
            ingress_recheck: Duration::from_secs(10),
            resync: Duration::from_secs(60),
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or empty variables keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Config::default();

        if let Some(namespace) = var("KUBE_READINESS_NAMESPACE") {
            config.namespace = Some(namespace);
        }
        if let Some(gate) = var("KUBE_READINESS_GATE") {
            config.gate = gate;
        }
        if let Some(region) = var("KUBE_READINESS_AWS_REGION") {
            config.aws_region = region;
        }
        config.assume_role_arn = var("KUBE_READINESS_AWS_ASSUME_ROLE_ARN");

        parse_into(&var, "KUBE_READINESS_HEALTH_PORT", &mut config.health_port)?;
        parse_bool(&var, "KUBE_READINESS_LEADER_ELECTION", &mut config.leader_election)?;
        parse_bool(&var, "KUBE_READINESS_SDK_CACHE", &mut config.sdk_cache)?;
        parse_into(&var, "KUBE_READINESS_WORKERS", &mut config.workers)?;
        parse_into(&var, "KUBE_READINESS_MAX_RETRIES", &mut config.max_retries)?;
        parse_bool(&var, "KUBE_READINESS_LOG_JSON", &mut config.log_json)?;

        let mut base_ms = config.backoff.base.as_millis() as u64;
        parse_into(&var, "KUBE_READINESS_BACKOFF_BASE_MS", &mut base_ms)?;
        config.backoff.base = Duration::from_millis(base_ms);
        parse_secs(&var, "KUBE_READINESS_BACKOFF_MAX_SECS", &mut config.backoff.max)?;
        parse_secs(&var, "KUBE_READINESS_CALL_TIMEOUT_SECS", &mut config.call_timeout)?;
        parse_secs(&var, "KUBE_READINESS_INGRESS_RECHECK_SECS", &mut config.ingress_recheck)?;
        parse_secs(&var, "KUBE_READINESS_RESYNC_SECS", &mut config.resync)?;

        if config.workers == 0 {
            return Err(invalid("KUBE_READINESS_WORKERS", "0", "must be at least 1"));
        }
        for (name, value) in [
            ("KUBE_READINESS_BACKOFF_BASE_MS", config.backoff.base),
            ("KUBE_READINESS_CALL_TIMEOUT_SECS", config.call_timeout),
            ("KUBE_READINESS_INGRESS_RECHECK_SECS", config.ingress_recheck),
            ("KUBE_READINESS_RESYNC_SECS", config.resync),
        ] {
            if value.is_zero() {
                return Err(invalid(name, "0", "must be greater than zero"));
            }
        }

        Ok(config)
    }
}

fn invalid(name: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_into<T, F>(var: &F, name: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *target = raw.trim().parse().map_err(|e: T::Err| invalid(name, &raw, e))?;
    }
    Ok(())
}

fn parse_secs<F>(var: &F, name: &'static str, target: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = target.as_secs();
    parse_into(var, name, &mut secs)?;
    *target = Duration::from_secs(secs);
    Ok(())
}

fn parse_bool<F>(var: &F, name: &'static str, target: &mut bool) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *target = match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => return Err(invalid(name, &raw, "expected true or false")),
        };
    }
    Ok(())
}
