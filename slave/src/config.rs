use std::{env, net::SocketAddr, time::Duration};

use sysinfo::{System, SystemExt};

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub master_url: String,
    pub listen_addr: SocketAddr,

    /// URL con la que el master nos manda jobs
    pub advertise_url: String,
    pub hostname: String,
    pub total_cores: u32,

    /// Memoria ofrecida en MB
    pub total_memory: u64,
    pub heartbeat_interval: Duration,
    pub simulated_work: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl SlaveConfig {
    /// - En Docker: MASTER_URL=http://master:8080
    /// - Sin variables: master local, cores y memoria de la máquina
    pub fn from_env() -> Self {
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let listen_addr: SocketAddr = env_parse("SLAVE_LISTEN_ADDR")
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9090)));

        let sys = System::new_all();
        let machine_cores = sys.cpus().len().max(1) as u32;
        let machine_memory_mb = (sys.total_memory() / (1024 * 1024)).max(1);

        Self {
            master_url: env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            advertise_url: env::var("SLAVE_ADVERTISE_URL")
                .unwrap_or_else(|_| advertise_default(&hostname, listen_addr)),
            listen_addr,
            total_cores: env_parse("SLAVE_CORES").unwrap_or(machine_cores),
            total_memory: env_parse("SLAVE_MEMORY_MB").unwrap_or(machine_memory_mb),
            heartbeat_interval: Duration::from_secs(env_parse("SLAVE_HEARTBEAT_SECS").unwrap_or(5)),
            simulated_work: Duration::from_millis(env_parse("SLAVE_SIMULATED_WORK_MS").unwrap_or(2000)),
            hostname,
        }
    }
}

fn advertise_default(hostname: &str, listen: SocketAddr) -> String {
    let host = if hostname.is_empty() { "localhost" } else { hostname };
    format!("http://{}:{}", host, listen.port())
}
