use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use crate::error::{HiveError, Result};

/// Margen mínimo entre el timeout de heartbeat y el intervalo con que los slaves
/// mandan heartbeats.
pub const HEARTBEAT_SAFETY_FACTOR: u32 = 3;

/// Cómo elegir slave cuando varios tienen hueco para un job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// El slave más chico que todavía cabe (menos fragmentación)
    BestFit,
    /// El slave con más hueco libre (reparte carga)
    WorstFit,
}

impl FromStr for PlacementPolicy {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-fit" | "bestfit" => Ok(PlacementPolicy::BestFit),
            "worst-fit" | "worstfit" => Ok(PlacementPolicy::WorstFit),
            other => Err(HiveError::Config(format!("política de placement desconocida: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HiveConfig {
    pub listen_addr: SocketAddr,
    pub scheduler_tick: Duration,

    /// Silencio máximo antes de declarar muerto a un slave
    pub heartbeat_timeout: Duration,
    pub heartbeat_poll_interval: Duration,

    /// Intervalo con que los slaves mandan heartbeats
    pub slave_heartbeat_interval: Duration,
    pub max_attempts: u32,
    pub janitor_interval: Duration,
    pub cleanup_interval: Duration,

    /// Antigüedad a partir de la cual se archivan jobs terminados
    pub retention: Duration,
    pub dispatch_timeout: Duration,
    pub placement: PlacementPolicy,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            scheduler_tick: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_secs(30),
            heartbeat_poll_interval: Duration::from_secs(5),
            slave_heartbeat_interval: Duration::from_secs(5),
            max_attempts: 3,
            janitor_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(24 * 3600),
            dispatch_timeout: Duration::from_secs(10),
            placement: PlacementPolicy::BestFit,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key).map(Duration::from_secs).unwrap_or(default)
}

impl HiveConfig {
    /// Lee la configuración de variables de entorno HIVE_*; lo que falte queda por defecto.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let placement = match env::var("HIVE_PLACEMENT") {
            Ok(s) => s.parse()?,
            Err(_) => d.placement,
        };

        let cfg = Self {
            listen_addr: env_parse("HIVE_LISTEN_ADDR").unwrap_or(d.listen_addr),
            scheduler_tick: env_parse::<u64>("HIVE_SCHEDULER_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.scheduler_tick),
            heartbeat_timeout: env_secs("HIVE_HEARTBEAT_TIMEOUT_SECS", d.heartbeat_timeout),
            heartbeat_poll_interval: env_secs("HIVE_HEARTBEAT_POLL_SECS", d.heartbeat_poll_interval),
            slave_heartbeat_interval: env_secs(
                "HIVE_SLAVE_HEARTBEAT_INTERVAL_SECS",
                d.slave_heartbeat_interval,
            ),
            max_attempts: env_parse("HIVE_MAX_ATTEMPTS").unwrap_or(d.max_attempts),
            janitor_interval: env_secs("HIVE_JANITOR_INTERVAL_SECS", d.janitor_interval),
            cleanup_interval: env_secs("HIVE_CLEANUP_INTERVAL_SECS", d.cleanup_interval),
            retention: env_secs("HIVE_RETENTION_SECS", d.retention),
            dispatch_timeout: env_secs("HIVE_DISPATCH_TIMEOUT_SECS", d.dispatch_timeout),
            placement,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let min_timeout = self.slave_heartbeat_interval * HEARTBEAT_SAFETY_FACTOR;
        if self.heartbeat_timeout < min_timeout {
            return Err(HiveError::Config(format!(
                "heartbeat_timeout ({:?}) debe ser >= {}x el intervalo de heartbeat de los slaves ({:?})",
                self.heartbeat_timeout, HEARTBEAT_SAFETY_FACTOR, self.slave_heartbeat_interval
            )));
        }
        if self.max_attempts == 0 {
            return Err(HiveError::Config("max_attempts debe ser >= 1".to_string()));
        }
        for (name, d) in [
            ("scheduler_tick", self.scheduler_tick),
            ("heartbeat_poll_interval", self.heartbeat_poll_interval),
            ("janitor_interval", self.janitor_interval),
        ] {
            if d.is_zero() {
                return Err(HiveError::Config(format!("{name} no puede ser 0")));
            }
        }
        Ok(())
    }

    pub fn heartbeat_timeout_chrono(&self) -> chrono::Duration {
        to_chrono(self.heartbeat_timeout)
    }

    pub fn cleanup_interval_chrono(&self) -> chrono::Duration {
        to_chrono(self.cleanup_interval)
    }

    pub fn retention_chrono(&self) -> chrono::Duration {
        to_chrono(self.retention)
    }
}

pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_por_defecto_es_valida() {
        let cfg = HiveConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.placement, PlacementPolicy::BestFit);
    }

    #[test]
    fn timeout_menor_a_tres_heartbeats_es_rechazado() {
        let cfg = HiveConfig {
            heartbeat_timeout: Duration::from_secs(10),
            slave_heartbeat_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(HiveError::Config(_))));

        let ok = HiveConfig {
            heartbeat_timeout: Duration::from_secs(15),
            slave_heartbeat_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn max_attempts_cero_es_rechazado() {
        let cfg = HiveConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parsea_politica_de_placement() {
        assert_eq!("best-fit".parse::<PlacementPolicy>().unwrap(), PlacementPolicy::BestFit);
        assert_eq!("Worst-Fit".parse::<PlacementPolicy>().unwrap(), PlacementPolicy::WorstFit);
        assert!("round-robin".parse::<PlacementPolicy>().is_err());
    }
}
